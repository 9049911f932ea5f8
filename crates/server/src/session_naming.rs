pub fn name_from_first_prompt(prompt: &str) -> Option<String> {
    let normalized = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() || is_bootstrap_prompt(&normalized) {
        return None;
    }

    let max_chars = 72;
    let mut out: String = normalized.chars().take(max_chars).collect();
    if normalized.chars().count() > max_chars {
        out.push('…');
    }
    Some(out)
}

fn is_bootstrap_prompt(message: &str) -> bool {
    message.starts_with("<system-reminder>")
        || message.starts_with("<command-name>")
        || message.starts_with("<local-command-stdout>")
        || message.contains("<environment_context>")
        || message.contains("Caveat: The messages below were generated by the user")
}

//! Welcome banner shown when the chat loop starts.

use console::style;

/// Banner lines: endpoint, model (or compare models) and session.
pub fn welcome_lines(
    endpoint: &str,
    model: &str,
    compare_models: &[String],
    session_name: &str,
) -> Vec<String> {
    let models = if compare_models.is_empty() {
        style(model).dim().to_string()
    } else {
        format!(
            "{} {}",
            style(compare_models.join(", ")).dim(),
            style("(compare)").yellow()
        )
    };

    vec![
        String::new(),
        format!("{} {}", style("*").cyan(), style("colloquy").cyan().bold()),
        String::new(),
        format!("{}  {}", style("Endpoint:").bold(), style(endpoint).dim()),
        format!("{}     {models}", style("Model:").bold()),
        format!("{}   {}", style("Session:").bold(), style(session_name).dim()),
        String::new(),
        style("Type /help for commands, Ctrl+D to exit").dim().to_string(),
        style("---").dim().to_string(),
        String::new(),
    ]
}

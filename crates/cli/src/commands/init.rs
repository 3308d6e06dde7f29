//! `arbiter init` — write a starter configuration file.

use arbiter_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    if config_path.exists() {
        println!("Config already exists: {}", config_path.display());
        println!("Edit it directly, or delete it and run `arbiter init` again.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let config = AppConfig::default();
    let rendered = toml::to_string_pretty(&config)?;
    std::fs::write(&config_path, rendered)?;

    println!("Wrote starter config: {}", config_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set an API key (OPENROUTER_API_KEY, OPENAI_API_KEY, or ARBITER_API_KEY)");
    println!("  2. Adjust the fallback chain and routing domains in the config");
    println!("  3. Try: arbiter ask \"What is the latest change to the deduction cap?\"");

    Ok(())
}

//! `attune onboard` — First-time setup.

use attune_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Attune — First-Time Setup");
    println!("=========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    } else {
        println!("Config directory exists: {}", config_dir.display());
    }

    if !config_path.exists() {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("Created default config: {}", config_path.display());
    } else {
        println!("Config exists, leaving it alone: {}", config_path.display());
    }

    println!("\nNext steps:");
    println!("  1. Edit {} (database url, inference base_url)", config_path.display());
    println!("  2. Run `attune serve` to start the gateway");

    Ok(())
}

use anyhow::Result;
use aprs_weather::config::WeatherConfig;
use std::path::Path;

pub fn handle_check_config(config: &WeatherConfig, path: &Path) -> Result<()> {
    let source = if path.exists() {
        format!("{}", path.display())
    } else {
        format!("defaults ({} not found)", path.display())
    };

    println!("# effective configuration from {}", source);
    print!("{}", config.to_display_toml()?);
    println!();
    println!("# login filter: {}", config.filter_expr()?);
    Ok(())
}

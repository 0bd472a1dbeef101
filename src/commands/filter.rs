use anyhow::Result;
use aprs_weather::config::WeatherConfig;

pub fn handle_filter(config: &WeatherConfig) -> Result<()> {
    println!("{}", config.filter_expr()?);
    Ok(())
}

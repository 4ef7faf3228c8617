use super::{json_pretty, EXIT_SUCCESS};
use lifeline_core::config::default_config_path;
use lifeline_core::EngineConfig;
use std::path::Path;

/// Print the engine configuration a session would run with.
pub fn run(path: Option<&Path>, json: bool) -> Result<u8, String> {
    let (config, source) = match path {
        Some(path) => (
            EngineConfig::load(path).map_err(|e| e.to_string())?,
            path.display().to_string(),
        ),
        None => {
            let config = EngineConfig::load_default().map_err(|e| e.to_string())?;
            let source = default_config_path()
                .filter(|p| p.exists())
                .map_or_else(|| "built-in defaults".to_owned(), |p| p.display().to_string());
            (config, source)
        }
    };

    if json {
        println!("{}", json_pretty(&config)?);
    } else {
        println!("# source: {source}");
        print!("{}", config.to_toml().map_err(|e| e.to_string())?);
    }
    Ok(EXIT_SUCCESS)
}

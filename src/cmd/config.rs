use anyhow::Result;
use std::path::PathBuf;

use super::ConfigAction;
use crate::runner::Session;

pub fn run(dir: PathBuf, action: Option<ConfigAction>, test: bool) -> Result<()> {
    let (suite, mut config) = super::load_project(&dir)?;

    match action {
        Some(ConfigAction::Get { key }) => match key {
            Some(key) => println!("{}", config.get_key(&key)?),
            None => print!("{}", serde_yaml_ng::to_string(&config)?),
        },
        Some(ConfigAction::Set { key, value }) => {
            config.set_key(&key, &value)?;
            config.save(&suite.config_path())?;
            println!("{key} = {}", config.get_key(&key)?);
        }
        None if !test => {
            print!("{}", serde_yaml_ng::to_string(&config)?);
        }
        None => {}
    }

    if test {
        let mut session = Session::connect(&config.pguri)?;
        let version = session
            .scalar("SHOW server_version")?
            .unwrap_or_else(|| "unknown".to_string());
        println!("connection ok (server {version})");
    }

    Ok(())
}

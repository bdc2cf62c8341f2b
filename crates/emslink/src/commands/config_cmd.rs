//! `config`: show, locate, and edit the profile file.

use emslink_config::{Profile, config_path, load_config_or_default, save_config};

use crate::cli::{ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn run(_global: &GlobalOpts, cmd: ConfigCommand) -> Result<(), CliError> {
    match cmd {
        ConfigCommand::Show => {
            let cfg = load_config_or_default();
            match toml::to_string_pretty(&cfg) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => println!("<unrenderable config: {e}>"),
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", config_path().display());
            Ok(())
        }
        ConfigCommand::Set { name, url, default } => {
            let mut cfg = load_config_or_default();
            let profile = cfg.connections.entry(name.clone()).or_insert_with(|| Profile {
                url: url.clone(),
                ..Profile::default()
            });
            profile.url = url;
            if default {
                cfg.default_connection = Some(name.clone());
            }
            save_config(&cfg)?;
            println!("{name}: profile saved");
            Ok(())
        }
    }
}

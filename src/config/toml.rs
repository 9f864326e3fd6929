use crate::config::{ConfigBackend, Configuration};
use anyhow::{Context, Error};
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;

#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn load_toml<P: AsRef<Path>>(file: P) -> Result<Self, Error> {
        let document = std::fs::read_to_string(file)?;
        let document = DocumentMut::from_str(&document)?;
        Ok(Self { document })
    }

    fn write_toml<P: AsRef<Path>>(&self, file: P) -> Result<(), Error> {
        if let Some(parent) = file.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(file, self.document.to_string())?;
        Ok(())
    }

    fn into_configuration(self) -> Result<Configuration, Error> {
        Ok(toml_edit::de::from_document(self.document)?)
    }

    fn edit_toml(&mut self, config: &Configuration) -> Result<(), Error> {
        // to_document does not prettify, so round-trip through the pretty string form
        let pretty_string = toml_edit::ser::to_string_pretty(&config)?;
        self.document = DocumentMut::from_str(&pretty_string)?;
        Ok(())
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> Result<Configuration, Error> {
        let file = file.as_ref();
        let toml = Self::load_toml(file)
            .context(format!("Reading configuration file {}", file.display()))?;
        toml.into_configuration()
            .context(format!("Parsing configuration file {}", file.display()))
    }

    fn save<P: AsRef<Path>>(config: &Configuration, file: P) -> Result<(), Error> {
        let mut toml = Self::load_toml(&file).unwrap_or(TomlConfiguration {
            document: DocumentMut::default(),
        });
        toml.edit_toml(config)?;
        toml.write_toml(file)
    }
}

//! Plugin configuration and its on-disk form.
//!
//! Settings live in a line-oriented `Key=Value` file next to the plugin binary,
//! readable and writable by anything - the format predates this implementation and is
//! kept byte-compatible. Unknown keys and out-of-range values are ignored so an old or
//! hand-edited file degrades to defaults instead of failing the load.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use strum::FromRepr;

use crate::Result;

/// File name the configuration is stored under, next to the plugin binary.
pub const CONFIG_FILE_NAME: &str = "MpqScope.ini";

/// Log file written when the configured name is relative and no game directory is known.
const DEFAULT_LOG_FILE_NAME: &str = "MpqScope_FileLog.txt";

/// Shape of one logged entry.
///
/// Discriminants are stable; they are what the configuration file stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr)]
#[repr(u8)]
pub enum LogFormat {
    /// `<timestamp> <archive>: <filename>`
    TimestampArchiveFilename = 0,
    /// `<archive>: <filename>`
    ArchiveFilename = 1,
    /// `<timestamp> <filename>`
    TimestampFilename = 2,
    /// `<filename>`
    #[default]
    FilenameOnly = 3,
}

impl LogFormat {
    /// Whether entries in this format name the archive a file came from.
    pub fn wants_archive(self) -> bool {
        matches!(
            self,
            LogFormat::TimestampArchiveFilename | LogFormat::ArchiveFilename
        )
    }

    /// Whether entries in this format carry a timestamp.
    pub fn wants_timestamp(self) -> bool {
        matches!(
            self,
            LogFormat::TimestampArchiveFilename | LogFormat::TimestampFilename
        )
    }
}

/// Which Storm.dll ordinal layout the target game uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromRepr)]
#[repr(u8)]
pub enum TargetGame {
    /// Diablo I; its Storm exports sit at different ordinals.
    Diablo1 = 0,
    /// StarCraft, Diablo II, Warcraft II and later.
    #[default]
    Later = 1,
}

/// Everything the plugin can be configured to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Log each distinct file only once.
    pub unique_only: bool,
    /// Shape of logged entries.
    pub format: LogFormat,
    /// Ordinal layout of the target game.
    pub target_game: TargetGame,
    /// Log file name; absolute paths are used as-is, relative ones land in the
    /// game directory.
    pub log_file_name: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            unique_only: true,
            format: LogFormat::default(),
            target_game: TargetGame::default(),
            log_file_name: DEFAULT_LOG_FILE_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load the configuration, falling back to defaults if the file is missing
    /// or unreadable.
    pub fn load(path: &Path) -> Config {
        match fs::read_to_string(path) {
            Ok(contents) => Config::parse(&contents),
            Err(err) => {
                debug!("config {} not loaded ({err}), using defaults", path.display());
                Config::default()
            }
        }
    }

    fn parse(contents: &str) -> Config {
        let mut config = Config::default();

        for line in contents.lines() {
            if let Some(value) = line.strip_prefix("LogUniqueOnly=") {
                config.unique_only = value == "1";
            } else if let Some(value) = line.strip_prefix("LogFormat=") {
                if let Some(format) = value.parse::<u8>().ok().and_then(LogFormat::from_repr) {
                    config.format = format;
                }
            } else if let Some(value) = line.strip_prefix("TargetGame=") {
                if let Some(game) = value.parse::<u8>().ok().and_then(TargetGame::from_repr) {
                    config.target_game = game;
                }
            } else if let Some(value) = line.strip_prefix("LogFileName=") {
                config.log_file_name = value.to_string();
            }
        }

        config
    }

    /// Write the configuration in its on-disk form.
    ///
    /// # Errors
    /// Returns the underlying I/O error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = format!(
            "LogUniqueOnly={}\nLogFormat={}\nTargetGame={}\nLogFileName={}\n",
            u8::from(self.unique_only),
            self.format as u8,
            self.target_game as u8,
            self.log_file_name,
        );

        fs::write(path, contents)?;
        Ok(())
    }

    /// Where the log file goes: the configured name as-is when absolute,
    /// otherwise inside `game_dir` when one is known.
    pub fn resolve_log_path(&self, game_dir: Option<&Path>) -> PathBuf {
        let name = Path::new(&self.log_file_name);
        if name.is_absolute() {
            return name.to_path_buf();
        }

        match game_dir {
            Some(dir) => dir.join(name),
            None => name.to_path_buf(),
        }
    }
}

//! External commands given as config values.

use std::{
    fmt::{self, Debug, Display},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{DuvizError, ErrorKind};

/// A command to be called which can be given as CLI option as well as in config files.
///
/// `CommandInput` implements `Serialize`/`Deserialize` (as its shell-quoted
/// string form) as well as `FromStr`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandInput {
    command: Option<String>,
    args: Vec<String>,
}

impl CommandInput {
    /// Returns if a command is set
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.command.is_some()
    }

    /// Returns the command if it is set
    ///
    /// # Panics
    ///
    /// Panics if no command is set.
    #[must_use]
    pub fn command(&self) -> &str {
        self.command.as_ref().unwrap()
    }

    /// Returns the command args
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn from_vec(mut vec: Vec<String>) -> Self {
        if vec.is_empty() {
            Self::default()
        } else {
            let command = Some(vec.remove(0));
            Self { command, args: vec }
        }
    }

    fn iter(&self) -> impl Iterator<Item = &String> {
        self.command.iter().chain(self.args.iter())
    }
}

impl From<Vec<String>> for CommandInput {
    fn from(value: Vec<String>) -> Self {
        Self::from_vec(value)
    }
}

impl FromStr for CommandInput {
    type Err = Box<DuvizError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words = shell_words::split(s).map_err(|err| {
            DuvizError::with_source(ErrorKind::Internal, "Failed to split command input.", err)
                .attach_context("input", s.to_string())
        })?;
        Ok(Self::from_vec(words))
    }
}

impl Display for CommandInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&shell_words::join(self.iter()))
    }
}

impl Serialize for CommandInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CommandInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_str(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_from_str_splits_shell_words() {
        let cmd: CommandInput = "sudo -n du".parse().unwrap();
        assert!(cmd.is_set());
        assert_eq!(cmd.command(), "sudo");
        assert_eq!(cmd.args(), ["-n", "du"]);
    }

    #[test]
    fn test_empty_command_is_not_set() {
        let cmd: CommandInput = "".parse().unwrap();
        assert!(!cmd.is_set());
    }

    #[test]
    fn test_display_round_trip() {
        let cmd: CommandInput = "find -x 'a b'".parse().unwrap();
        let back: CommandInput = cmd.to_string().parse().unwrap();
        assert_eq!(cmd, back);
    }
}

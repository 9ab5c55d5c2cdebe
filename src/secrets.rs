use std::{fs, io, path::Path};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// Largest secrets file that will be read.
const MAX_FILE_SIZE: u64 = 4096;

/// Login credentials read from a local TOML file.
///
/// ```toml
/// identifier = "someone@example.com"
/// password = "hunter2"
/// ```
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct Credentials {
    pub identifier: String,

    #[redact]
    pub password: String,
}

/// Checks that `path` is small enough to be a secrets file.
///
/// # Errors
///
/// Returns error if the file cannot be inspected or is too large.
pub fn check<P: AsRef<Path>>(path: P) -> io::Result<()> {
    // Prevent out-of-memory condition: secrets files should be small.
    let path = path.as_ref();
    let file_size = fs::metadata(path)?.len();

    if file_size > MAX_FILE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} is too large", path.display()),
        ));
    }

    Ok(())
}

/// Reads `path` after checking its size.
///
/// # Errors
///
/// Returns error if the file is missing, too large or not UTF-8.
pub fn read<P: AsRef<Path>>(path: P) -> io::Result<String> {
    check(&path)?;
    fs::read_to_string(path)
}

/// Loads credentials from a TOML file.
///
/// # Errors
///
/// Returns error if the file cannot be read, is malformed, or contains an
/// empty identifier or password.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Credentials> {
    let contents = read(&path)?;
    let credentials: Credentials = toml::from_str(&contents)?;

    if credentials.identifier.is_empty() || credentials.password.is_empty() {
        return Err(Error::invalid_argument(format!(
            "{} must contain an identifier and a password",
            path.as_ref().display()
        )));
    }

    Ok(credentials)
}

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;

/// Desktop browser user agents the upstream platform accepts.
///
/// One is picked at random per client, like a rotating pool, so repeated
/// runs do not present a single fingerprint.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// Contents of the optional secrets file.
///
/// Holds the session cookie for authenticated API calls. Anonymous
/// operation works without it, at reduced link quality.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Secrets {
    /// The `SESSDATA` session cookie value.
    pub sessdata: Option<String>,
}

impl Secrets {
    /// Loads secrets from a TOML file.
    ///
    /// A missing file is not an error: it yields empty secrets and the
    /// engine runs unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the file exists but cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("no secrets file at {}; continuing anonymously", path.display());
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,

    /// User agent presented on every upstream call.
    pub user_agent: String,

    /// Session cookie, if any.
    pub sessdata: Option<String>,

    /// Root under which all artifacts are written.
    pub output_dir: PathBuf,
}

impl Config {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>, secrets: Secrets) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let user_agent = USER_AGENTS[fastrand::usize(..USER_AGENTS.len())].to_owned();
        trace!("user agent: {user_agent}");

        Self {
            app_name,
            app_version,
            user_agent,
            sessdata: secrets.sessdata,
            output_dir: output_dir.into(),
        }
    }

    /// Directory for finished audio artifacts.
    #[must_use]
    pub fn audio_dir(&self) -> PathBuf {
        self.output_dir.join("audio")
    }

    /// Directory for cover images.
    #[must_use]
    pub fn cover_dir(&self) -> PathBuf {
        self.output_dir.join("cover")
    }

    /// Directory for transcript text files.
    #[must_use]
    pub fn subtitle_dir(&self) -> PathBuf {
        self.output_dir.join("subtitle")
    }

    /// Scratch directory for per-segment downloads and unmoved merges.
    #[must_use]
    pub fn temp_dir(&self) -> PathBuf {
        self.audio_dir().join("temp")
    }

    /// Creates the output directory tree.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any directory cannot be created.
    pub fn ensure_directories(&self) -> io::Result<()> {
        for dir in [
            self.audio_dir(),
            self.cover_dir(),
            self.subtitle_dir(),
            self.temp_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

//! File drop-box for requests from the CLI.
//!
//! Clients write `*.toml` request files into the queue directory. The daemon
//! applies them in file-name order and moves each one to `processed/` next to
//! a `.result` file holding the reply.

use std::{
    fmt,
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    job::{JobId, JobSpec},
    lab::Lab,
    scheduler::CancelOutcome,
};

/// One request file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit: Option<JobSpec>,
}

/// Outcome written to the `.result` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Submitted(JobId),
    Cancelled(JobId, CancelOutcome),
    Rejected(String),
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Submitted(id) => write!(f, "submitted {id}"),
            Self::Cancelled(id, outcome) => write!(f, "cancel {id}: {outcome}"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// The request drop-box of one lab.
#[derive(Debug, Clone)]
pub struct Intake {
    dir: PathBuf,
}

impl Intake {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn processed_dir(&self) -> PathBuf {
        self.dir.join("processed")
    }

    /// Request files waiting to be applied, in name order.
    fn pending(&self) -> Result<Vec<PathBuf>, IntakeError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IntakeError::Io(self.dir.clone(), e)),
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| !n.to_string_lossy().starts_with('.'))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Apply every waiting request.
    pub fn poll(&self, lab: &Lab) -> Result<Vec<(PathBuf, Reply)>, IntakeError> {
        let mut applied = Vec::new();
        for path in self.pending()? {
            let reply = match fs::read_to_string(&path) {
                Ok(body) => apply(lab, &body),
                Err(e) => Reply::Rejected(format!("unreadable request: {e}")),
            };
            tracing::info!(request = %path.display(), "{reply}");
            self.archive(&path, &reply)?;
            applied.push((path, reply));
        }
        Ok(applied)
    }

    fn archive(&self, path: &Path, reply: &Reply) -> Result<(), IntakeError> {
        let processed = self.processed_dir();
        fs::create_dir_all(&processed).map_err(|e| IntakeError::Io(processed.clone(), e))?;

        let Some(name) = path.file_name() else {
            return Ok(());
        };
        let target = processed.join(name);
        fs::rename(path, &target).map_err(|e| IntakeError::Io(path.to_path_buf(), e))?;

        let result = result_path(&target);
        fs::write(&result, format!("{reply}\n")).map_err(|e| IntakeError::Io(result.clone(), e))
    }

    /// Write `request` atomically and return the path it will be archived
    /// under once processed.
    pub fn send(&self, request: &Request) -> Result<PathBuf, IntakeError> {
        fs::create_dir_all(&self.dir).map_err(|e| IntakeError::Io(self.dir.clone(), e))?;

        let name = format!(
            "{}-{}.toml",
            chrono::Local::now().format("%Y%m%d%H%M%S%f"),
            std::process::id()
        );
        let body = toml::to_string(request).map_err(|e| IntakeError::Encode(e.to_string()))?;

        let tmp = self.dir.join(format!(".{name}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(|e| IntakeError::Io(tmp.clone(), e))?;
        file.write_all(body.as_bytes())
            .map_err(|e| IntakeError::Io(tmp.clone(), e))?;
        drop(file);

        let path = self.dir.join(&name);
        fs::rename(&tmp, &path).map_err(|e| IntakeError::Io(path.clone(), e))?;
        Ok(self.processed_dir().join(name))
    }

    /// Wait for the reply to a request sent with [`Intake::send`].
    pub async fn wait_reply(archived: &Path, timeout: Duration) -> Option<String> {
        let result = result_path(archived);
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(body) = tokio::fs::read_to_string(&result).await
                && !body.is_empty()
            {
                return Some(body.trim_end().to_string());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        None
    }
}

fn result_path(archived: &Path) -> PathBuf {
    let mut name = archived.as_os_str().to_owned();
    name.push(".result");
    PathBuf::from(name)
}

/// Parse, authenticate and execute one request body.
fn apply(lab: &Lab, body: &str) -> Reply {
    let request: Request = match toml::from_str(body) {
        Ok(request) => request,
        Err(e) => return Reply::Rejected(format!("invalid request: {e}")),
    };

    let config = lab.config();
    if config.requires_auth() {
        let user = request.user.as_deref().unwrap_or_default();
        let password = request.password.as_deref().unwrap_or_default();
        if !config.authenticate(user, password) {
            tracing::warn!(user, "authentication failed");
            return Reply::Rejected("authentication failed".into());
        }
    }

    match (request.submit, request.cancel) {
        (Some(spec), None) => match lab.submit(spec) {
            Ok(id) => Reply::Submitted(id),
            Err(e) => Reply::Rejected(e.to_string()),
        },
        (None, Some(id)) => match lab.cancel(id) {
            Ok(outcome) => Reply::Cancelled(id, outcome),
            Err(e) => Reply::Rejected(e.to_string()),
        },
        _ => Reply::Rejected("expected exactly one of [submit] or cancel".into()),
    }
}

/// Errors that stop request processing.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("request queue I/O on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to encode request: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes() {
        let request: Request = toml::from_str(
            r#"
user = "alice"
password = "secret"

[submit]
project = "mnist"
command = "python train.py"
gpus = 1
"#,
        )
        .unwrap();
        assert_eq!(request.submit.as_ref().map(|s| s.gpus), Some(1));
        assert_eq!(request.cancel, None);

        let request: Request = toml::from_str("cancel = 7").unwrap();
        assert_eq!(request.cancel, Some(JobId(7)));
    }

    #[test]
    fn test_send_writes_visible_request() {
        let dir = tempfile::tempdir().unwrap();
        let intake = Intake::new(dir.path());
        let archived = intake
            .send(&Request {
                cancel: Some(JobId(3)),
                ..Request::default()
            })
            .unwrap();

        let pending = intake.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            archived.file_name(),
            pending[0].file_name(),
            "reply is archived under the request name"
        );
        let body = fs::read_to_string(&pending[0]).unwrap();
        assert_eq!(toml::from_str::<Request>(&body).unwrap().cancel, Some(JobId(3)));
        assert_eq!(
            result_path(&archived).extension().and_then(|e| e.to_str()),
            Some("result")
        );
    }
}

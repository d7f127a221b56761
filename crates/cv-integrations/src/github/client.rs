use cv_core::config::{CredentialProvider, GitHubConfig};
use octocrab::Octocrab;

use crate::host::{GitHostError, Result};

impl From<octocrab::Error> for GitHostError {
    fn from(err: octocrab::Error) -> Self {
        match err {
            octocrab::Error::GitHub { source, .. } => {
                let mut message = source.message.clone();
                if let Some(errors) = source.errors.as_ref() {
                    for detail in errors {
                        if let Some(text) = detail.get("message").and_then(|m| m.as_str()) {
                            message.push_str(": ");
                            message.push_str(text);
                        }
                    }
                }
                GitHostError::Status {
                    status: source.status_code.as_u16(),
                    message,
                }
            }
            other => GitHostError::Api(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitHubClient {
    pub(crate) octocrab: Octocrab,
    pub(crate) owner: String,
    pub(crate) repo: String,
}

impl GitHubClient {
    /// Create a client for `owner/repo` authenticated with `token`.
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
    ) -> Result<Self> {
        let octocrab = Octocrab::builder().personal_token(token.into()).build()?;

        Ok(Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    /// Create a client from the `[github]` config section, reading the token
    /// from the configured environment variable.
    pub fn from_config(config: &GitHubConfig) -> Result<Self> {
        let token = CredentialProvider::github_token(config)
            .ok_or_else(|| GitHostError::MissingToken(config.token_env.clone()))?;
        let owner = config
            .owner
            .clone()
            .ok_or_else(|| GitHostError::Config("github.owner is not set".into()))?;
        let repo = config
            .repo
            .clone()
            .ok_or_else(|| GitHostError::Config("github.repo is not set".into()))?;
        Self::new(token, owner, repo)
    }

    /// Returns a reference to the inner `Octocrab` instance.
    pub fn inner(&self) -> &Octocrab {
        &self.octocrab
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub(crate) fn route(&self, tail: &str) -> String {
        format!("/repos/{}/{}/{}", self.owner, self.repo, tail)
    }
}

use crate::model::TenantScope;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
    pub workspaces: HashSet<String>,
    pub projects: HashSet<String>,
    pub attributes: HashMap<String, String>,
}

impl Principal {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            workspaces: HashSet::new(),
            projects: HashSet::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_workspaces<I, S>(mut self, workspaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workspaces = workspaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_projects<I, S>(mut self, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projects = projects.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn member_of_workspace(&self, workspace_id: &str) -> bool {
        self.workspaces.contains(workspace_id)
    }

    pub fn member_of_project(&self, project_id: &str) -> bool {
        self.projects.contains(project_id)
    }

    /// Membership policy for a tenant scope. Global is readable by any
    /// authenticated principal; workspace needs workspace membership;
    /// project needs workspace AND project membership.
    pub fn may_access(&self, scope: &TenantScope) -> bool {
        match scope {
            TenantScope::Global => true,
            TenantScope::Workspace { workspace_id } => self.member_of_workspace(workspace_id),
            TenantScope::Project {
                workspace_id,
                project_id,
            } => self.member_of_workspace(workspace_id) && self.member_of_project(project_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    #[serde(default)]
    pub workspaces: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    pub exp: usize,
    #[serde(default)]
    pub nbf: Option<usize>,
    #[serde(default)]
    pub iat: Option<usize>,
}

impl TryFrom<JwtClaims> for Principal {
    type Error = AuthError;

    fn try_from(claims: JwtClaims) -> Result<Self, Self::Error> {
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        let collect = |values: Vec<String>| -> HashSet<String> {
            values
                .into_iter()
                .filter_map(|value| {
                    let trimmed = value.trim();
                    (!trimmed.is_empty()).then(|| trimmed.to_string())
                })
                .collect()
        };

        Ok(Principal {
            subject: claims.sub,
            workspaces: collect(claims.workspaces),
            projects: collect(claims.projects),
            attributes: claims.attributes,
        })
    }
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new_hs256(
        secret: impl AsRef<[u8]>,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_ref()),
            validation,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let normalized = token
            .trim()
            .strip_prefix("Bearer ")
            .or_else(|| token.trim().strip_prefix("bearer "))
            .unwrap_or(token)
            .trim();
        if normalized.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let token_data = decode::<JwtClaims>(normalized, &self.decoding_key, &self.validation)
            .map_err(|err| AuthError::InvalidToken(err.to_string()))?;
        Principal::try_from(token_data.claims)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid jwt: {0}")]
    InvalidToken(String),
    #[error("jwt claim sub must not be empty")]
    MissingSubject,
}

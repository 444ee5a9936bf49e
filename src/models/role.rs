//! Role vocabulary: the three closed capability sets and the roles built from them.
//!
//! Every scope owns a fixed list of boolean capabilities:
//! - General: site-wide administration (users, models, roles, access)
//! - Model: visibility and management of one model
//! - Instance: data and label workflows on one instance
//!
//! Transport layers speak capability names as strings (`"edit_users"`,
//! `"can_see_instance"`, ...). Those strings are parsed exactly once, at the
//! boundary, through [`Capability::parse`]; unknown names are rejected instead
//! of being treated as "not granted".

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;

/// The resource level a role or grant applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum Scope {
    General,
    Model,
    Instance,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::General => "general",
            Scope::Model => "model",
            Scope::Instance => "instance",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "general" => Ok(Scope::General),
            "model" => Ok(Scope::Model),
            "instance" => Ok(Scope::Instance),
            other => Err(AppError::BadRequest(format!("unknown scope '{}'", other))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GeneralCapability {
    GrantAccess,
    EditUsers,
    EditModels,
    EditRoles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelCapability {
    CanSee,
    Instantiate,
    Edit,
    DownloadCode,
    GrantAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceCapability {
    CanSee,
    AddSample,
    GetTrainingData,
    GetInferenceData,
    Edit,
    GrantAccess,
    RequestLabel,
    ResponseLabel,
}

impl GeneralCapability {
    pub const ALL: [GeneralCapability; 4] = [
        GeneralCapability::GrantAccess,
        GeneralCapability::EditUsers,
        GeneralCapability::EditModels,
        GeneralCapability::EditRoles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GeneralCapability::GrantAccess => "grant_access",
            GeneralCapability::EditUsers => "edit_users",
            GeneralCapability::EditModels => "edit_models",
            GeneralCapability::EditRoles => "edit_roles",
        }
    }
}

impl ModelCapability {
    pub const ALL: [ModelCapability; 5] = [
        ModelCapability::CanSee,
        ModelCapability::Instantiate,
        ModelCapability::Edit,
        ModelCapability::DownloadCode,
        ModelCapability::GrantAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelCapability::CanSee => "can_see_model",
            ModelCapability::Instantiate => "instantiate_model",
            ModelCapability::Edit => "edit_model",
            ModelCapability::DownloadCode => "download_model",
            ModelCapability::GrantAccess => "grant_access_model",
        }
    }
}

impl InstanceCapability {
    pub const ALL: [InstanceCapability; 8] = [
        InstanceCapability::CanSee,
        InstanceCapability::AddSample,
        InstanceCapability::GetTrainingData,
        InstanceCapability::GetInferenceData,
        InstanceCapability::Edit,
        InstanceCapability::GrantAccess,
        InstanceCapability::RequestLabel,
        InstanceCapability::ResponseLabel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceCapability::CanSee => "can_see_instance",
            InstanceCapability::AddSample => "add_sample",
            InstanceCapability::GetTrainingData => "get_training_data",
            InstanceCapability::GetInferenceData => "get_inference_data",
            InstanceCapability::Edit => "edit_instance",
            InstanceCapability::GrantAccess => "grant_access_instance",
            InstanceCapability::RequestLabel => "request_labels",
            InstanceCapability::ResponseLabel => "response_labels",
        }
    }
}

/// One named boolean permission inside a scope's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    General(GeneralCapability),
    Model(ModelCapability),
    Instance(InstanceCapability),
}

impl Capability {
    pub fn scope(&self) -> Scope {
        match self {
            Capability::General(_) => Scope::General,
            Capability::Model(_) => Scope::Model,
            Capability::Instance(_) => Scope::Instance,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::General(c) => c.as_str(),
            Capability::Model(c) => c.as_str(),
            Capability::Instance(c) => c.as_str(),
        }
    }

    /// Every capability of a scope, in vocabulary order.
    pub fn all(scope: Scope) -> Vec<Capability> {
        match scope {
            Scope::General => GeneralCapability::ALL.iter().copied().map(Capability::General).collect(),
            Scope::Model => ModelCapability::ALL.iter().copied().map(Capability::Model).collect(),
            Scope::Instance => InstanceCapability::ALL
                .iter()
                .copied()
                .map(Capability::Instance)
                .collect(),
        }
    }

    /// Parse a transport token within the vocabulary of `scope`.
    ///
    /// A name that exists only in another scope's vocabulary is rejected as well.
    pub fn parse(scope: Scope, token: &str) -> Result<Capability, AppError> {
        Capability::all(scope)
            .into_iter()
            .find(|c| c.as_str() == token)
            .ok_or_else(|| {
                AppError::BadRequest(format!("unknown {} capability '{}'", scope, token))
            })
    }

    /// Bit position inside a [`CapabilitySet`]. Scopes occupy disjoint ranges.
    fn bit(&self) -> u32 {
        let index = match self {
            Capability::General(c) => *c as u32,
            Capability::Model(c) => 4 + *c as u32,
            Capability::Instance(c) => 9 + *c as u32,
        };
        1 << index
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<GeneralCapability> for Capability {
    fn from(c: GeneralCapability) -> Self {
        Capability::General(c)
    }
}

impl From<ModelCapability> for Capability {
    fn from(c: ModelCapability) -> Self {
        Capability::Model(c)
    }
}

impl From<InstanceCapability> for Capability {
    fn from(c: InstanceCapability) -> Self {
        Capability::Instance(c)
    }
}

/// A set of capabilities, stored as a bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Every capability of the given scope.
    pub fn full(scope: Scope) -> Self {
        Capability::all(scope).into_iter().collect()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn remove(&mut self, cap: Capability) {
        self.0 &= !cap.bit();
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0 | other.0)
    }

    /// True iff every capability of `required` is in `self`.
    pub fn is_superset(&self, required: &CapabilitySet) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Capabilities of `scope` present in the set, in vocabulary order.
    pub fn iter(&self, scope: Scope) -> impl Iterator<Item = Capability> + '_ {
        Capability::all(scope).into_iter().filter(|c| self.contains(*c))
    }

    /// Canonical names of the members, as persisted and sent on the wire.
    pub fn names(&self, scope: Scope) -> Vec<String> {
        self.iter(scope).map(|c| c.as_str().to_string()).collect()
    }

    /// Parse a list of transport tokens. Any unknown token fails the whole list.
    pub fn parse<S: AsRef<str>>(scope: Scope, tokens: &[S]) -> Result<CapabilitySet, AppError> {
        let mut set = CapabilitySet::empty();
        for token in tokens {
            set.insert(Capability::parse(scope, token.as_ref())?);
        }
        Ok(set)
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

/// A named, reusable set of capabilities within one scope.
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub id: Uuid,
    pub scope: Scope,
    pub name: String,
    pub description: String,
    pub essential: bool,
    pub capabilities: CapabilitySet,
}

impl Role {
    pub fn new(scope: Scope, name: &str, description: &str, capabilities: CapabilitySet) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            name: name.to_string(),
            description: description.to_string(),
            essential: false,
            capabilities,
        }
    }

    /// Look up the boolean for one capability. Capabilities of other scopes are never held.
    pub fn check(&self, cap: Capability) -> bool {
        cap.scope() == self.scope && self.capabilities.contains(cap)
    }
}

/// Wire representation of a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleView {
    pub role_uuid: Uuid,
    pub scope: Scope,
    pub role_name: String,
    pub role_description: String,
    pub is_essential: bool,
    pub capabilities: Vec<String>,
}

impl From<&Role> for RoleView {
    fn from(role: &Role) -> Self {
        Self {
            role_uuid: role.id,
            scope: role.scope,
            role_name: role.name.clone(),
            role_description: role.description.clone(),
            is_essential: role.essential,
            capabilities: role.capabilities.names(role.scope),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

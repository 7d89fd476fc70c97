//! Record descriptors and IoR records
//!
//! A [`RecordDescriptor`] is plain data: which endpoint a record lives on, the
//! identity used to find or create it, static attributes, and the dependency
//! fields that must be resolved before it can be created. Resolution mechanics
//! live in [`crate::resolver`]; no entity type overrides them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Server-assigned record identifier
pub type RecordId = u64;

/// IoR application namespace grouping endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppNamespace {
    /// Data-center infrastructure: sites, devices, interfaces
    Dcim,
    /// Clusters and virtual machines
    Virtualization,
    /// IP address management
    Ipam,
    /// Tags and other cross-cutting objects
    Extras,
}

impl AppNamespace {
    /// Path segment used by the IoR REST API
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dcim => "dcim",
            Self::Virtualization => "virtualization",
            Self::Ipam => "ipam",
            Self::Extras => "extras",
        }
    }
}

impl fmt::Display for AppNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every entity type the engine reconciles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Provenance tag
    Tag,
    /// Physical site
    Site,
    /// Device role
    DeviceRole,
    /// Device manufacturer
    Manufacturer,
    /// Device type (hardware model)
    DeviceType,
    /// Physical device (a Proxmox node)
    Device,
    /// Device interface
    Interface,
    /// Cluster type
    ClusterType,
    /// Virtualization cluster
    Cluster,
    /// Virtual machine
    VirtualMachine,
    /// Virtual machine interface
    VmInterface,
    /// IP address
    IpAddress,
}

impl RecordKind {
    /// All kinds, leaves first
    pub const ALL: [RecordKind; 12] = [
        Self::Tag,
        Self::Site,
        Self::DeviceRole,
        Self::Manufacturer,
        Self::DeviceType,
        Self::ClusterType,
        Self::Cluster,
        Self::Device,
        Self::Interface,
        Self::VirtualMachine,
        Self::VmInterface,
        Self::IpAddress,
    ];

    /// Namespace the endpoint lives in
    pub const fn namespace(self) -> AppNamespace {
        match self {
            Self::Tag => AppNamespace::Extras,
            Self::Site
            | Self::DeviceRole
            | Self::Manufacturer
            | Self::DeviceType
            | Self::Device
            | Self::Interface => AppNamespace::Dcim,
            Self::ClusterType | Self::Cluster | Self::VirtualMachine | Self::VmInterface => {
                AppNamespace::Virtualization
            }
            Self::IpAddress => AppNamespace::Ipam,
        }
    }

    /// Collection name within the namespace
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::Tag => "tags",
            Self::Site => "sites",
            Self::DeviceRole => "device-roles",
            Self::Manufacturer => "manufacturers",
            Self::DeviceType => "device-types",
            Self::Device => "devices",
            Self::Interface | Self::VmInterface => "interfaces",
            Self::ClusterType => "cluster-types",
            Self::Cluster => "clusters",
            Self::VirtualMachine => "virtual-machines",
            Self::IpAddress => "ip-addresses",
        }
    }

    /// Human-readable name for diagnostics
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Tag => "Tag",
            Self::Site => "Site",
            Self::DeviceRole => "Device Role",
            Self::Manufacturer => "Manufacturer",
            Self::DeviceType => "Device Type",
            Self::Device => "Device",
            Self::Interface => "Interface",
            Self::ClusterType => "Cluster Type",
            Self::Cluster => "Cluster",
            Self::VirtualMachine => "Virtual Machine",
            Self::VmInterface => "VM Interface",
            Self::IpAddress => "IP Address",
        }
    }

    /// Whether the endpoint stores a native `slug` column
    pub const fn has_slug(self) -> bool {
        matches!(
            self,
            Self::Tag
                | Self::Site
                | Self::DeviceRole
                | Self::Manufacturer
                | Self::DeviceType
                | Self::ClusterType
        )
    }

    /// Field holding the record's display name on the wire
    pub const fn name_field(self) -> &'static str {
        match self {
            Self::DeviceType => "model",
            Self::IpAddress => "address",
            _ => "name",
        }
    }

    /// Parent reference that scopes names for child records
    pub const fn scope_field(self) -> Option<&'static str> {
        match self {
            Self::Interface => Some("device"),
            Self::VmInterface => Some("virtual_machine"),
            _ => None,
        }
    }

    /// `namespace/endpoint` path fragment
    pub fn path(self) -> String {
        format!("{}/{}", self.namespace(), self.endpoint())
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Derive a slug: lower-case, runs of non-alphanumerics collapsed to `-`
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Minimal identity used both to search for and to create a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Display name
    pub name: String,
    /// Unique key per endpoint
    pub slug: String,
    /// Free-text description
    pub description: String,
}

impl Identity {
    /// Identity with an explicit slug
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: description.into(),
        }
    }

    /// Identity whose slug is derived from the name
    pub fn derived(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        let slug = slugify(&name);
        Self {
            name,
            slug,
            description: description.into(),
        }
    }
}

/// How a dependency field behaves when its target cannot be resolved
#[derive(Debug, Clone, PartialEq)]
pub enum DependencyPolicy {
    /// No id, no record
    Required,
    /// Fall back to a default record when the target is absent or fails
    WithFallback(Box<RecordDescriptor>),
}

/// One field of a record that points at another record
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    /// Field name on the dependent record
    pub field: &'static str,
    /// Record to resolve; `None` when discovery reported nothing usable
    pub target: Option<Box<RecordDescriptor>>,
    /// Behavior when `target` cannot be resolved
    pub policy: DependencyPolicy,
}

impl Dependency {
    /// Required dependency on a known record
    pub fn required(field: &'static str, target: RecordDescriptor) -> Self {
        Self {
            field,
            target: Some(Box::new(target)),
            policy: DependencyPolicy::Required,
        }
    }

    /// Required dependency whose target may not have been discovered
    pub fn required_if_known(field: &'static str, target: Option<RecordDescriptor>) -> Self {
        Self {
            field,
            target: target.map(Box::new),
            policy: DependencyPolicy::Required,
        }
    }

    /// Dependency that falls back to a default record
    pub fn with_fallback(
        field: &'static str,
        target: Option<RecordDescriptor>,
        fallback: RecordDescriptor,
    ) -> Self {
        Self {
            field,
            target: target.map(Box::new),
            policy: DependencyPolicy::WithFallback(Box::new(fallback)),
        }
    }

    /// Entity type of the dependency
    pub fn kind(&self) -> Option<RecordKind> {
        match (&self.target, &self.policy) {
            (Some(target), _) => Some(target.kind),
            (None, DependencyPolicy::WithFallback(fallback)) => Some(fallback.kind),
            (None, DependencyPolicy::Required) => None,
        }
    }

    /// Name of the record this dependency points at, if known
    pub fn target_name(&self) -> Option<&str> {
        match (&self.target, &self.policy) {
            (Some(target), _) => Some(target.identity.name.as_str()),
            (None, DependencyPolicy::WithFallback(fallback)) => Some(fallback.identity.name.as_str()),
            (None, DependencyPolicy::Required) => None,
        }
    }
}

/// Memo key: one entry per `(endpoint, scope, lookup)`, where `lookup` is
/// the rendered search filter. Two descriptors share an entry exactly when
/// the IoR would answer them with the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Entity type
    pub kind: RecordKind,
    /// Parent record for scoped kinds
    pub scope: Option<RecordId>,
    /// Rendered search filter
    pub lookup: String,
}

/// One term of a search filter
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
    /// Record field to match
    pub field: String,
    /// Expected value
    pub value: Value,
    /// Whether `field` is a reference to another record
    pub reference: bool,
}

/// Filter used to look a record up before creating it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchFilter {
    terms: Vec<FilterTerm>,
}

impl SearchFilter {
    /// Add an equality term
    pub fn equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.terms.push(FilterTerm {
            field: field.into(),
            value: value.into(),
            reference: false,
        });
        self
    }

    /// Add a reference term (`field` points at record `id`)
    pub fn reference(mut self, field: impl Into<String>, id: RecordId) -> Self {
        self.terms.push(FilterTerm {
            field: field.into(),
            value: Value::from(id),
            reference: true,
        });
        self
    }

    /// Filter terms in insertion order
    pub fn terms(&self) -> &[FilterTerm] {
        &self.terms
    }

    /// Query-string pairs; reference fields use the `<field>_id` convention
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.terms
            .iter()
            .map(|term| {
                let key = if term.reference {
                    format!("{}_id", term.field)
                } else {
                    term.field.clone()
                };
                let value = match &term.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect()
    }

    /// Check a record against every term
    pub fn matches(&self, record: &Record) -> bool {
        self.terms.iter().all(|term| {
            if term.reference {
                record.reference(&term.field) == term.value.as_u64()
            } else {
                record.fields.get(&term.field) == Some(&term.value)
            }
        })
    }
}

impl fmt::Display for SearchFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .query_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&rendered.join("&"))
    }
}

/// Fixed description of how to find, default-populate and create one record
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDescriptor {
    /// Entity type
    pub kind: RecordKind,
    /// Search and create identity
    pub identity: Identity,
    /// Static fields merged into the create payload
    pub attributes: Map<String, Value>,
    /// Fields resolved through other descriptors before creation
    pub dependencies: Vec<Dependency>,
    /// Parent record for scoped kinds
    pub scope: Option<RecordId>,
}

impl RecordDescriptor {
    /// Descriptor with no attributes or dependencies
    pub fn new(kind: RecordKind, identity: Identity) -> Self {
        Self {
            kind,
            identity,
            attributes: Map::new(),
            dependencies: Vec::new(),
            scope: None,
        }
    }

    /// Add a static attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add a dependency field
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// Scope the record to a parent (interfaces to their device, ...)
    pub fn scoped_to(mut self, parent: RecordId) -> Self {
        self.scope = Some(parent);
        self
    }

    /// Application namespace
    pub fn namespace(&self) -> AppNamespace {
        self.kind.namespace()
    }

    /// Endpoint name
    pub fn endpoint(&self) -> &'static str {
        self.kind.endpoint()
    }

    /// Display name of the entity type
    pub fn display_name(&self) -> &'static str {
        self.kind.display_name()
    }

    /// Record name
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Memo key for this descriptor
    pub fn key(&self) -> RecordKey {
        RecordKey {
            kind: self.kind,
            scope: self.scope,
            lookup: self.search_filter().to_string(),
        }
    }

    /// Lookup filter: slug (plus name for tags) on slugged endpoints,
    /// otherwise the natural name within the parent scope.
    pub fn search_filter(&self) -> SearchFilter {
        let mut filter = SearchFilter::default();

        if self.kind.has_slug() {
            filter = filter.equals("slug", self.identity.slug.as_str());
            if self.kind == RecordKind::Tag {
                filter = filter.equals("name", self.identity.name.as_str());
            }
        } else {
            filter = filter.equals(self.kind.name_field(), self.identity.name.as_str());
        }

        if let (Some(field), Some(parent)) = (self.kind.scope_field(), self.scope) {
            filter = filter.reference(field, parent);
        }

        filter
    }

    /// Create payload before dependency ids and tags are merged in
    pub fn base_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            self.kind.name_field().to_string(),
            Value::from(self.identity.name.as_str()),
        );
        if self.kind.has_slug() {
            fields.insert("slug".to_string(), Value::from(self.identity.slug.as_str()));
        }
        if !self.identity.description.is_empty() {
            fields.insert(
                "description".to_string(),
                Value::from(self.identity.description.as_str()),
            );
        }
        for (key, value) in &self.attributes {
            fields.insert(key.clone(), value.clone());
        }
        if let (Some(field), Some(parent)) = (self.kind.scope_field(), self.scope) {
            fields.insert(field.to_string(), Value::from(parent));
        }
        fields
    }
}

/// A record as stored in the IoR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Server-assigned identifier
    pub id: RecordId,
    /// Every other field as returned by the IoR
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Build a record from an id and its fields
    pub fn new(id: RecordId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    /// Raw field value
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// String field value
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Id of a referenced record; accepts a bare id or a nested `{ "id": .. }`
    pub fn reference(&self, name: &str) -> Option<RecordId> {
        match self.fields.get(name)? {
            Value::Number(n) => n.as_u64(),
            Value::Object(obj) => obj.get("id").and_then(Value::as_u64),
            _ => None,
        }
    }

    /// Ids of every tag attached to the record
    pub fn tag_ids(&self) -> Vec<RecordId> {
        match self.fields.get("tags") {
            Some(Value::Array(tags)) => tags
                .iter()
                .filter_map(|tag| match tag {
                    Value::Number(n) => n.as_u64(),
                    Value::Object(obj) => obj.get("id").and_then(Value::as_u64),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Best label for diagnostics
    pub fn label(&self) -> String {
        ["name", "model", "address", "slug"]
            .iter()
            .find_map(|field| self.str_field(field))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

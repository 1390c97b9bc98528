//! Version resolution for logical keys.
//!
//! Every write of a key is a new immutable object. Each one carries the ids
//! it saw as visible (`S3-Versions-add`) and the ids it considers deleted
//! (`S3-Versions-del`). Folding all discovered versions of a key unions both
//! lists into a two-phase set: once an id lands in the del-set it never comes
//! back, and the fold result does not depend on discovery order.

use crate::models::object::{ObjectId, ObjectInfo};
use serde::{Deserialize, Serialize};
use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

pub const VERSIONS_ADD_ATTR: &str = "S3-Versions-add";
pub const VERSIONS_DEL_ATTR: &str = "S3-Versions-del";
pub const VERSIONS_UNVERSIONED_ATTR: &str = "S3-Versions-unversioned";
pub const VERSIONS_DELETE_MARK_ATTR: &str = "S3-Versions-delete-mark";
/// Delete mark value hiding the whole key.
pub const DEL_MARK_FULL_OBJECT: &str = "*";
/// Version id surfaced for writes made while versioning was disabled.
pub const UNVERSIONED_VERSION_ID: &str = "null";

/// Set of version ids, serialized as a comma-joined header value.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VersionIdSet(BTreeSet<String>);

impl VersionIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_header(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn to_header(&self) -> String {
        self.0.iter().map(String::as_str).collect::<Vec<_>>().join(",")
    }

    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.0.insert(id.into())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    /// In-place union.
    pub fn union_with(&mut self, other: &VersionIdSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn difference(&self, other: &VersionIdSet) -> VersionIdSet {
        VersionIdSet(self.0.difference(&other.0).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromIterator<String> for VersionIdSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        VersionIdSet(iter.into_iter().collect())
    }
}

/// Value of the `S3-Versions-delete-mark` header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeleteMark {
    /// Hides the whole key from unversioned reads.
    FullObject,
    /// Records the removal of one specific version.
    Version(String),
}

impl DeleteMark {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => None,
            DEL_MARK_FULL_OBJECT => Some(DeleteMark::FullObject),
            id => Some(DeleteMark::Version(id.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionKind {
    Object,
    DeleteMarker,
}

/// One entry of a version listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectVersionInfo {
    pub object: ObjectInfo,
    pub kind: VersionKind,
    pub is_latest: bool,
}

impl ObjectInfo {
    pub fn delete_mark(&self) -> Option<DeleteMark> {
        self.headers
            .get(VERSIONS_DELETE_MARK_ATTR)
            .and_then(|v| DeleteMark::parse(v))
    }

    pub fn is_unversioned(&self) -> bool {
        self.headers
            .get(VERSIONS_UNVERSIONED_ATTR)
            .is_some_and(|v| v == "true")
    }

    /// Whole-key delete marker.
    pub fn is_delete_marker(&self) -> bool {
        matches!(self.delete_mark(), Some(DeleteMark::FullObject))
    }

    /// Bookkeeping record of a version-specific delete.
    pub fn is_deletion_record(&self) -> bool {
        matches!(self.delete_mark(), Some(DeleteMark::Version(_)))
    }

    /// Version id as shown to clients: `null` for unversioned writes.
    pub fn surfaced_version(&self) -> String {
        if self.is_unversioned() {
            UNVERSIONED_VERSION_ID.to_string()
        } else {
            self.version()
        }
    }
}

/// Total order of versions: creation epoch, then id.
pub fn version_order(a: &ObjectInfo, b: &ObjectInfo) -> Ordering {
    a.creation_epoch
        .cmp(&b.creation_epoch)
        .then_with(|| a.version().cmp(&b.version()))
}

/// All discovered versions of one logical key.
#[derive(Clone, Debug)]
pub struct ObjectVersions {
    name: String,
    objects: Vec<ObjectInfo>,
    add: VersionIdSet,
    del: VersionIdSet,
    dirty: bool,
}

impl ObjectVersions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
            add: VersionIdSet::new(),
            del: VersionIdSet::new(),
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn add_set(&self) -> &VersionIdSet {
        &self.add
    }

    pub fn del_set(&self) -> &VersionIdSet {
        &self.del
    }

    /// Fold one version in. Folding the same version twice is a no-op.
    pub fn append_version(&mut self, info: ObjectInfo) {
        self.add.insert(info.version());
        if let Some(add) = info.headers.get(VERSIONS_ADD_ATTR) {
            self.add.union_with(&VersionIdSet::parse_header(add));
        }
        if let Some(del) = info.headers.get(VERSIONS_DEL_ATTR) {
            self.del.union_with(&VersionIdSet::parse_header(del));
        }
        if self.objects.iter().all(|o| o.id != info.id) {
            self.objects.push(info);
            self.dirty = true;
        }
    }

    pub fn existing(&self) -> VersionIdSet {
        self.add.difference(&self.del)
    }

    fn sort(&mut self) {
        if self.dirty {
            self.objects.sort_by(version_order);
            self.dirty = false;
        }
    }

    /// Current version of the key, `None` when it is deleted or was never
    /// written.
    pub fn last(&mut self) -> Option<&ObjectInfo> {
        self.last_matching(|_| true)
    }

    /// Current version among writes made with versioning disabled.
    pub fn last_unversioned(&mut self) -> Option<&ObjectInfo> {
        self.last_matching(ObjectInfo::is_unversioned)
    }

    fn last_matching(&mut self, eligible: impl Fn(&ObjectInfo) -> bool) -> Option<&ObjectInfo> {
        self.sort();
        let existing = self.existing();
        for info in self.objects.iter().rev() {
            if !existing.contains(&info.version()) || !eligible(info) {
                continue;
            }
            match info.delete_mark() {
                None => return Some(info),
                Some(DeleteMark::FullObject) => return None,
                Some(DeleteMark::Version(_)) => continue,
            }
        }
        None
    }

    /// Existing payload versions and whole-key delete markers in total order.
    pub fn filtered(&mut self) -> Vec<(VersionKind, &ObjectInfo)> {
        self.sort();
        let existing = self.existing();
        self.objects
            .iter()
            .filter(|info| existing.contains(&info.version()))
            .filter_map(|info| match info.delete_mark() {
                None => Some((VersionKind::Object, info)),
                Some(DeleteMark::FullObject) => Some((VersionKind::DeleteMarker, info)),
                Some(DeleteMark::Version(_)) => None,
            })
            .collect()
    }

    /// Existing versions written with versioning disabled, in total order.
    pub fn unversioned(&mut self) -> Vec<&ObjectInfo> {
        self.sort();
        let existing = self.existing();
        self.objects
            .iter()
            .filter(|info| info.is_unversioned() && existing.contains(&info.version()))
            .collect()
    }

    pub fn version(&self, id: ObjectId) -> Option<&ObjectInfo> {
        self.objects.iter().find(|info| info.id == id)
    }
}

/// Merge the version-control headers of a new write of the key into
/// `headers`.
///
/// An explicit delete mark for a specific version must already be present in
/// `headers`; its id joins the del-set and nothing else is superseded.
/// Otherwise returns the ids the write supersedes physically: the prior
/// unversioned versions when versioning is disabled.
pub fn update_version_headers(
    headers: &mut BTreeMap<String, String>,
    versions: &mut ObjectVersions,
    versioning_enabled: bool,
) -> Vec<ObjectId> {
    if !versioning_enabled {
        headers.insert(VERSIONS_UNVERSIONED_ATTR.to_string(), "true".to_string());
    }

    if versions.is_empty() {
        return Vec::new();
    }

    if !versions.add_set().is_empty() {
        headers.insert(VERSIONS_ADD_ATTR.to_string(), versions.add_set().to_header());
    }

    let mut del = versions.del_set().clone();
    let deleted_version = match headers
        .get(VERSIONS_DELETE_MARK_ATTR)
        .and_then(|v| DeleteMark::parse(v))
    {
        Some(DeleteMark::Version(id)) => Some(id),
        _ => None,
    };

    let mut superseded = Vec::new();
    if let Some(id) = deleted_version {
        del.insert(id);
    } else if !versioning_enabled {
        for info in versions.unversioned() {
            del.insert(info.version());
            superseded.push(info.id);
        }
    }

    if !del.is_empty() {
        headers.insert(VERSIONS_DEL_ATTR.to_string(), del.to_header());
    }

    superseded
}

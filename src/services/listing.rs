//! Bucket listings: flat V1 and V2 listings of current versions and the full
//! version history listing.
//!
//! Every listing runs the same pipeline: collect the ids under the prefix,
//! resolve and fold them per key, sort, collapse common prefixes, apply the
//! cursor and cut the page. A cursor always names the last entry of the
//! previous page and resumes strictly after it.

use crate::{
    models::{
        bucket::BucketInfo,
        object::{ObjectInfo, ObjectMeta},
    },
    network::SearchParams,
    services::{
        context::RequestContext,
        error::LayerResult,
        gateway::{Gateway, HEAD_CONCURRENCY},
        versions::{ObjectVersionInfo, ObjectVersions, VersionKind},
    },
};
use futures::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsParamsCommon {
    pub bucket: String,
    pub prefix: String,
    /// Empty disables common-prefix grouping.
    pub delimiter: String,
    pub max_keys: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsParamsV1 {
    pub common: ListObjectsParamsCommon,
    pub marker: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsParamsV2 {
    pub common: ListObjectsParamsCommon,
    /// Version id of the last entry of the previous page.
    pub continuation_token: Option<String>,
    /// Only honoured without a continuation token.
    pub start_after: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectVersionsParams {
    pub bucket: String,
    pub prefix: String,
    pub delimiter: String,
    pub max_keys: usize,
    pub key_marker: String,
    pub version_id_marker: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsInfo {
    pub common_prefixes: Vec<String>,
    pub objects: Vec<ObjectInfo>,
    pub is_truncated: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsInfoV1 {
    pub info: ListObjectsInfo,
    pub next_marker: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectsInfoV2 {
    pub info: ListObjectsInfo,
    pub next_continuation_token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListObjectVersionsInfo {
    pub common_prefixes: Vec<String>,
    pub versions: Vec<ObjectVersionInfo>,
    pub delete_markers: Vec<ObjectVersionInfo>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

/// An entry that can stand in for a common prefix.
trait ListEntry {
    fn name(&self) -> &str;
    fn is_dir(&self) -> bool;
    fn into_dir(self, prefix: String) -> Self;
}

impl ListEntry for ObjectInfo {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn into_dir(self, prefix: String) -> Self {
        ObjectInfo::into_dir(self, prefix)
    }
}

impl ListEntry for ObjectVersionInfo {
    fn name(&self) -> &str {
        &self.object.name
    }

    fn is_dir(&self) -> bool {
        self.object.is_dir
    }

    fn into_dir(self, prefix: String) -> Self {
        ObjectVersionInfo {
            object: self.object.into_dir(prefix),
            kind: VersionKind::Object,
            is_latest: false,
        }
    }
}

/// Replace every entry whose name continues past `prefix` with `delimiter`
/// by one common-prefix entry. `entries` must be sorted by name, which keeps
/// the entries of one common prefix adjacent.
fn collapse<T: ListEntry>(entries: Vec<T>, prefix: &str, delimiter: &str) -> Vec<T> {
    if delimiter.is_empty() {
        return entries;
    }

    let mut out: Vec<T> = Vec::with_capacity(entries.len());
    for entry in entries {
        let dir = entry
            .name()
            .strip_prefix(prefix)
            .and_then(|tail| tail.find(delimiter).map(|pos| &tail[..pos + delimiter.len()]))
            .map(|tail| format!("{}{}", prefix, tail));

        match dir {
            Some(dir) => {
                if out.last().is_some_and(|last| last.is_dir() && last.name() == dir) {
                    continue;
                }
                out.push(entry.into_dir(dir));
            }
            None => out.push(entry),
        }
    }
    out
}

/// Cut `entries` to `max_keys` and return the last kept entry when the page
/// is truncated.
fn truncate<T: Clone>(entries: &mut Vec<T>, max_keys: usize) -> Option<T> {
    if entries.len() <= max_keys {
        return None;
    }
    entries.truncate(max_keys);
    entries.last().cloned()
}

fn split_prefixes(entries: Vec<ObjectInfo>) -> ListObjectsInfo {
    let mut info = ListObjectsInfo::default();
    for entry in entries {
        if entry.is_dir {
            info.common_prefixes.push(entry.name);
        } else {
            info.objects.push(entry);
        }
    }
    info
}

impl Gateway {
    pub async fn list_objects_v1(
        &self,
        ctx: &RequestContext,
        params: &ListObjectsParamsV1,
    ) -> LayerResult<ListObjectsInfoV1> {
        if params.common.max_keys == 0 {
            return Ok(ListObjectsInfoV1::default());
        }

        let mut entries = self.list_current(ctx, &params.common).await?;
        if !params.marker.is_empty() {
            entries.retain(|entry| entry.name > params.marker);
        }

        let last = truncate(&mut entries, params.common.max_keys);
        let mut info = split_prefixes(entries);
        info.is_truncated = last.is_some();
        Ok(ListObjectsInfoV1 {
            info,
            next_marker: last.map(|entry| entry.name),
        })
    }

    pub async fn list_objects_v2(
        &self,
        ctx: &RequestContext,
        params: &ListObjectsParamsV2,
    ) -> LayerResult<ListObjectsInfoV2> {
        if params.common.max_keys == 0 {
            return Ok(ListObjectsInfoV2::default());
        }

        let mut entries = self.list_current(ctx, &params.common).await?;
        match params.continuation_token.as_deref() {
            Some(token) if !token.is_empty() => {
                let found = entries.iter().position(|entry| entry.version() == token);
                entries = match found {
                    Some(pos) => entries.split_off(pos + 1),
                    None => Vec::new(),
                };
            }
            _ if !params.start_after.is_empty() => {
                entries.retain(|entry| entry.name > params.start_after);
            }
            _ => {}
        }

        let last = truncate(&mut entries, params.common.max_keys);
        let mut info = split_prefixes(entries);
        info.is_truncated = last.is_some();
        Ok(ListObjectsInfoV2 {
            info,
            next_continuation_token: last.map(|entry| entry.version()),
        })
    }

    pub async fn list_object_versions(
        &self,
        ctx: &RequestContext,
        params: &ListObjectVersionsParams,
    ) -> LayerResult<ListObjectVersionsInfo> {
        if params.max_keys == 0 {
            return Ok(ListObjectVersionsInfo::default());
        }

        let bkt = self.bucket_info(ctx, &params.bucket).await?;
        let mut entries = match self.caches.list_versions(
            bkt.container,
            &params.prefix,
            &params.delimiter,
        ) {
            Some(entries) => entries,
            None => {
                let entries = self.resolve_history(ctx, &bkt, params).await?;
                self.caches.put_list_versions(
                    bkt.container,
                    &params.prefix,
                    &params.delimiter,
                    entries.clone(),
                );
                entries
            }
        };

        if !params.key_marker.is_empty() {
            if params.version_id_marker.is_empty() {
                entries.retain(|entry| entry.object.name > params.key_marker);
            } else {
                let marker = (params.key_marker.as_str(), params.version_id_marker.as_str());
                entries.retain(|entry| {
                    (entry.object.name.as_str(), entry.object.version().as_str()) > marker
                });
            }
        }

        let last = truncate(&mut entries, params.max_keys);
        let mut res = ListObjectVersionsInfo {
            is_truncated: last.is_some(),
            ..Default::default()
        };
        if let Some(last) = last {
            res.next_version_id_marker = (!last.object.is_dir).then(|| last.object.version());
            res.next_key_marker = Some(last.object.name);
        }

        for entry in entries {
            if entry.object.is_dir {
                res.common_prefixes.push(entry.object.name);
            } else if entry.kind == VersionKind::DeleteMarker {
                res.delete_markers.push(entry);
            } else {
                res.versions.push(entry);
            }
        }
        Ok(res)
    }

    /// Current version of every key under the prefix, sorted by name and
    /// collapsed by the delimiter.
    async fn list_current(
        &self,
        ctx: &RequestContext,
        params: &ListObjectsParamsCommon,
    ) -> LayerResult<Vec<ObjectInfo>> {
        let bkt = self.bucket_info(ctx, &params.bucket).await?;
        let versions = self.resolve_keys(ctx, &bkt, &params.prefix).await?;

        let current: Vec<ObjectInfo> = versions
            .into_values()
            .filter_map(|mut versions| versions.last().cloned())
            .collect();
        debug!(bucket = %bkt.name, prefix = %params.prefix, keys = current.len(), "resolved current versions");

        Ok(collapse(current, &params.prefix, &params.delimiter))
    }

    /// Visible history of every key under the prefix, sorted by key and
    /// version id and collapsed by the delimiter.
    async fn resolve_history(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        params: &ListObjectVersionsParams,
    ) -> LayerResult<Vec<ObjectVersionInfo>> {
        let versions = self.resolve_keys(ctx, bkt, &params.prefix).await?;

        let mut history = Vec::new();
        for mut key_versions in versions.into_values() {
            let filtered = key_versions.filtered();
            let newest = filtered.len().saturating_sub(1);
            history.extend(
                filtered
                    .into_iter()
                    .enumerate()
                    .map(|(i, (kind, object))| ObjectVersionInfo {
                        object: object.clone(),
                        kind,
                        is_latest: i == newest,
                    }),
            );
        }
        history.sort_by(|a, b| {
            a.object
                .name
                .cmp(&b.object.name)
                .then_with(|| a.object.version().cmp(&b.object.version()))
        });
        debug!(bucket = %bkt.name, prefix = %params.prefix, versions = history.len(), "resolved version history");

        Ok(collapse(history, &params.prefix, &params.delimiter))
    }

    /// Fold every object under `prefix` into per-key version sets, ordered
    /// by key.
    async fn resolve_keys(
        &self,
        ctx: &RequestContext,
        bkt: &BucketInfo,
        prefix: &str,
    ) -> LayerResult<BTreeMap<String, ObjectVersions>> {
        let ids = match self.caches.list_ids(bkt.container, prefix) {
            Some(ids) => ids,
            None => {
                let params = SearchParams {
                    container: bkt.container,
                    filters: Vec::new(),
                    prefix: prefix.to_string(),
                };
                let ids = ctx.run(self.network.search(ctx, &params)).await?;
                self.caches.put_list_ids(bkt.container, prefix, ids.clone());
                ids
            }
        };

        let metas: Vec<Option<ObjectMeta>> = stream::iter(ids)
            .map(|id| self.object_from_cache_or_network(ctx, bkt.container, id))
            .buffered(HEAD_CONCURRENCY)
            .try_collect()
            .await?;

        let mut by_key: BTreeMap<String, ObjectVersions> = BTreeMap::new();
        for info in metas
            .iter()
            .flatten()
            .filter_map(|meta| ObjectInfo::from_meta(&bkt.name, meta))
            .filter(|info| !info.is_system() && info.name.starts_with(prefix))
        {
            by_key
                .entry(info.name.clone())
                .or_insert_with(|| ObjectVersions::new(info.name.clone()))
                .append_version(info);
        }
        Ok(by_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        gateway::{DeleteObjectParams, HeadObjectParams},
        testing::Fixture,
    };

    fn common(prefix: &str, delimiter: &str, max_keys: usize) -> ListObjectsParamsCommon {
        ListObjectsParamsCommon {
            bucket: Fixture::BUCKET.into(),
            prefix: prefix.into(),
            delimiter: delimiter.into(),
            max_keys,
        }
    }

    fn names(info: &ListObjectsInfo) -> Vec<&str> {
        info.objects.iter().map(|o| o.name.as_str()).collect()
    }

    async fn seed(fx: &Fixture, keys: &[&str]) {
        for key in keys {
            fx.put(key, b"data").await;
        }
    }

    #[tokio::test]
    async fn zero_max_keys_never_reaches_the_network() {
        let fx = Fixture::new().await;
        seed(&fx, &["a", "b"]).await;
        let searches = fx.network.search_calls();

        let v1 = fx
            .gateway
            .list_objects_v1(
                &fx.ctx,
                &ListObjectsParamsV1 {
                    common: common("", "", 0),
                    marker: String::new(),
                },
            )
            .await
            .unwrap();
        assert!(v1.info.objects.is_empty());
        assert!(!v1.info.is_truncated);

        let versions = fx
            .gateway
            .list_object_versions(
                &fx.ctx,
                &ListObjectVersionsParams {
                    bucket: Fixture::BUCKET.into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(versions.versions.is_empty());
        assert_eq!(fx.network.search_calls(), searches);
    }

    #[tokio::test]
    async fn delimiter_groups_common_prefixes() {
        let fx = Fixture::new().await;
        seed(&fx, &["a/1", "a/2", "b"]).await;

        let res = fx
            .gateway
            .list_objects_v1(
                &fx.ctx,
                &ListObjectsParamsV1 {
                    common: common("", "/", 1000),
                    marker: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(res.info.common_prefixes, vec!["a/"]);
        assert_eq!(names(&res.info), vec!["b"]);
        assert!(!res.info.is_truncated);
        assert!(res.next_marker.is_none());
    }

    #[tokio::test]
    async fn prefix_restricts_listing() {
        let fx = Fixture::new().await;
        seed(&fx, &["photos/1", "photos/2", "docs/1"]).await;

        let res = fx
            .gateway
            .list_objects_v1(
                &fx.ctx,
                &ListObjectsParamsV1 {
                    common: common("photos/", "", 1000),
                    marker: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(names(&res.info), vec!["photos/1", "photos/2"]);
    }

    #[tokio::test]
    async fn v1_pages_reassemble_the_full_listing() {
        let fx = Fixture::new().await;
        seed(&fx, &["c", "a", "b"]).await;

        let mut marker = String::new();
        let mut paged = Vec::new();
        loop {
            let page = fx
                .gateway
                .list_objects_v1(
                    &fx.ctx,
                    &ListObjectsParamsV1 {
                        common: common("", "", 1),
                        marker: marker.clone(),
                    },
                )
                .await
                .unwrap();
            paged.extend(page.info.objects.iter().map(|o| o.name.clone()));
            match page.next_marker {
                Some(next) => marker = next,
                None => break,
            }
        }
        assert_eq!(paged, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn v2_pages_walk_common_prefixes_and_keys() {
        let fx = Fixture::new().await;
        seed(&fx, &["a/1", "a/2", "b", "c"]).await;

        let mut token = None;
        let mut prefixes = Vec::new();
        let mut keys = Vec::new();
        loop {
            let page = fx
                .gateway
                .list_objects_v2(
                    &fx.ctx,
                    &ListObjectsParamsV2 {
                        common: common("", "/", 1),
                        continuation_token: token.clone(),
                        start_after: String::new(),
                    },
                )
                .await
                .unwrap();
            prefixes.extend(page.info.common_prefixes.clone());
            keys.extend(page.info.objects.iter().map(|o| o.name.clone()));
            if page.next_continuation_token.is_none() {
                break;
            }
            token = page.next_continuation_token;
        }
        assert_eq!(prefixes, vec!["a/"]);
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn v2_unknown_token_yields_empty_page() {
        let fx = Fixture::new().await;
        seed(&fx, &["a", "b"]).await;

        let res = fx
            .gateway
            .list_objects_v2(
                &fx.ctx,
                &ListObjectsParamsV2 {
                    common: common("", "", 10),
                    continuation_token: Some("nothing".into()),
                    start_after: String::new(),
                },
            )
            .await
            .unwrap();
        assert!(res.info.objects.is_empty());
        assert!(!res.info.is_truncated);

        let res = fx
            .gateway
            .list_objects_v2(
                &fx.ctx,
                &ListObjectsParamsV2 {
                    common: common("", "", 10),
                    continuation_token: None,
                    start_after: "a".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(names(&res.info), vec!["b"]);
    }

    #[tokio::test]
    async fn deleted_keys_disappear_from_flat_listing() {
        let fx = Fixture::versioned().await;
        seed(&fx, &["a", "b"]).await;
        fx.gateway
            .delete_object(
                &fx.ctx,
                &DeleteObjectParams {
                    bucket: Fixture::BUCKET.into(),
                    key: "a".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();

        let res = fx
            .gateway
            .list_objects_v1(
                &fx.ctx,
                &ListObjectsParamsV1 {
                    common: common("", "", 10),
                    marker: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(names(&res.info), vec!["b"]);
    }

    #[tokio::test]
    async fn writes_invalidate_cached_listings() {
        let fx = Fixture::new().await;
        seed(&fx, &["dir/a"]).await;
        let params = ListObjectsParamsV1 {
            common: common("dir/", "", 10),
            marker: String::new(),
        };

        fx.gateway.list_objects_v1(&fx.ctx, &params).await.unwrap();
        let searches = fx.network.search_calls();
        fx.gateway.list_objects_v1(&fx.ctx, &params).await.unwrap();
        assert_eq!(fx.network.search_calls(), searches);

        fx.put("dir/b", b"data").await;
        let res = fx.gateway.list_objects_v1(&fx.ctx, &params).await.unwrap();
        assert_eq!(names(&res.info), vec!["dir/a", "dir/b"]);
    }

    #[tokio::test]
    async fn version_listing_splits_markers_and_flags_latest() {
        let fx = Fixture::versioned().await;
        let first = fx.put("k", b"one").await;
        let second = fx.put("k", b"two").await;
        let marker = fx
            .gateway
            .delete_object(
                &fx.ctx,
                &DeleteObjectParams {
                    bucket: Fixture::BUCKET.into(),
                    key: "k".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();
        fx.put("other", b"x").await;

        let res = fx
            .gateway
            .list_object_versions(
                &fx.ctx,
                &ListObjectVersionsParams {
                    bucket: Fixture::BUCKET.into(),
                    max_keys: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut ids: Vec<String> = res
            .versions
            .iter()
            .filter(|v| v.object.name == "k")
            .map(|v| v.object.version())
            .collect();
        ids.sort();
        let mut expected = vec![first.version(), second.version()];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(res.versions.iter().filter(|v| v.object.name == "k").all(|v| !v.is_latest));

        assert_eq!(res.delete_markers.len(), 1);
        assert_eq!(res.delete_markers[0].object.version(), marker.version_id);
        assert!(res.delete_markers[0].is_latest);

        let other: Vec<_> = res.versions.iter().filter(|v| v.object.name == "other").collect();
        assert_eq!(other.len(), 1);
        assert!(other[0].is_latest);
    }

    #[tokio::test]
    async fn version_listing_pages_reassemble_history() {
        let fx = Fixture::versioned().await;
        seed(&fx, &["a", "a", "b/1", "c"]).await;

        let full = fx
            .gateway
            .list_object_versions(
                &fx.ctx,
                &ListObjectVersionsParams {
                    bucket: Fixture::BUCKET.into(),
                    delimiter: "/".into(),
                    max_keys: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(full.common_prefixes, vec!["b/"]);
        assert_eq!(full.versions.len(), 3);

        let mut key_marker = String::new();
        let mut version_id_marker = String::new();
        let mut versions = Vec::new();
        let mut prefixes = Vec::new();
        loop {
            let page = fx
                .gateway
                .list_object_versions(
                    &fx.ctx,
                    &ListObjectVersionsParams {
                        bucket: Fixture::BUCKET.into(),
                        delimiter: "/".into(),
                        max_keys: 1,
                        key_marker: key_marker.clone(),
                        version_id_marker: version_id_marker.clone(),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            versions.extend(page.versions);
            prefixes.extend(page.common_prefixes);
            if !page.is_truncated {
                break;
            }
            key_marker = page.next_key_marker.unwrap_or_default();
            version_id_marker = page.next_version_id_marker.unwrap_or_default();
        }
        assert_eq!(versions, full.versions);
        assert_eq!(prefixes, full.common_prefixes);
    }

    #[tokio::test]
    async fn current_version_follows_latest_write() {
        let fx = Fixture::versioned().await;
        fx.put("k", b"one").await;
        let second = fx.put("k", b"two").await;

        let res = fx
            .gateway
            .list_objects_v1(
                &fx.ctx,
                &ListObjectsParamsV1 {
                    common: common("", "", 10),
                    marker: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(res.info.objects.len(), 1);
        assert_eq!(res.info.objects[0].id, second.id);

        let head = fx
            .gateway
            .head_object(
                &fx.ctx,
                &HeadObjectParams {
                    bucket: Fixture::BUCKET.into(),
                    key: "k".into(),
                    version_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(head.id, second.id);
    }

    #[test]
    fn collapse_keeps_sorted_positions() {
        struct Entry(String, bool);
        impl ListEntry for Entry {
            fn name(&self) -> &str {
                &self.0
            }
            fn is_dir(&self) -> bool {
                self.1
            }
            fn into_dir(self, prefix: String) -> Self {
                Entry(prefix, true)
            }
        }

        let entries: Vec<Entry> = ["p/a", "p/b/1", "p/b/2", "p/c", "p/d/x/y"]
            .iter()
            .map(|n| Entry(n.to_string(), false))
            .collect();
        let out: Vec<_> = collapse(entries, "p/", "/")
            .into_iter()
            .map(|e| (e.0, e.1))
            .collect();
        assert_eq!(
            out,
            vec![
                ("p/a".to_string(), false),
                ("p/b/".to_string(), true),
                ("p/c".to_string(), false),
                ("p/d/".to_string(), true),
            ]
        );
    }
}

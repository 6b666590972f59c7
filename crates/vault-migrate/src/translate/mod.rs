//! Source-to-destination node translation.
//!
//! [`NodeTranslator::translate`] is a pure function of one source node and the
//! destination root id. Structural problems (bad link target, bad timestamp,
//! unknown node type) are errors and abort the enclosing job. Bad ACL entries
//! and bad property keys are dropped with a warning and reported in
//! [`Translation::skipped`].

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::core::node::*;
use crate::error::{MigrateError, Result};

/// Properties with a structural equivalent in the destination schema (or no
/// meaning there); never copied into the destination property list.
pub const IGNORED_PROPERTIES: &[&str] = &[
    PROP_CONTENT_ENCODING,
    PROP_CONTENT_LENGTH,
    PROP_CONTENT_MD5,
    PROP_TYPE,
    PROP_CREATION_DATE,
    PROP_CREATOR,
    PROP_DATE,
    PROP_FORMAT,
    PROP_GROUPMASK,
    PROP_GROUPREAD,
    PROP_GROUPWRITE,
    PROP_ISLOCKED,
    PROP_ISPUBLIC,
    PROP_READABLE,
    PROP_WRITABLE,
    PROP_AVAILABLE_SPACE,
    PROP_QUOTA,
];

/// Prefix applied to legacy storage ids.
pub const STORAGE_ID_PREFIX: &str = "cadc:vault/";

/// Base used only to check the syntax of relative URI references.
const RELATIVE_BASE: &str = "vos://relative.invalid/";

/// IVOA timestamp format used by the legacy `date` property.
const IVOA_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// A field value dropped during translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    /// Which field the value came from (`groupread`, `groupwrite`, `property`).
    pub field: &'static str,
    pub value: String,
    pub reason: String,
}

/// Output of a successful translation.
#[derive(Debug, Clone)]
pub struct Translation {
    pub node: Node,
    pub skipped: Vec<SkippedItem>,
}

/// Converts source-shaped nodes into destination-shaped nodes.
#[derive(Debug, Clone)]
pub struct NodeTranslator {
    root_id: Uuid,
}

impl NodeTranslator {
    pub fn new(root_id: Uuid) -> Self {
        Self { root_id }
    }

    pub fn root_id(&self) -> Uuid {
        self.root_id
    }

    /// Translate and discard the skipped-item report.
    pub fn convert(&self, src: &SourceNode) -> Result<Node> {
        self.translate(src).map(|t| t.node)
    }

    pub fn translate(&self, src: &SourceNode) -> Result<Translation> {
        debug!("in: {:?}", src);
        let kind = match &src.kind {
            SourceKind::Container => NodeKind::Container {
                inherit_permissions: true,
            },
            SourceKind::Data {
                storage_id,
                content_length,
            } => NodeKind::Data {
                storage_id: format!("{}{}", STORAGE_ID_PREFIX, storage_id),
                bytes_used: *content_length,
                busy: false,
            },
            SourceKind::Link { target } => NodeKind::Link {
                target: normalize_link_target(&src.path, target)?,
            },
            SourceKind::Other(tag) => {
                return Err(MigrateError::UnsupportedNode {
                    path: src.path.clone(),
                    kind: tag.clone(),
                })
            }
        };

        let mut skipped = Vec::new();

        let read_only_groups = src
            .property_value(PROP_GROUPREAD)
            .map(|raw| parse_groups(&src.path, "groupread", raw, &mut skipped))
            .unwrap_or_default();
        let read_write_groups = src
            .property_value(PROP_GROUPWRITE)
            .map(|raw| parse_groups(&src.path, "groupwrite", raw, &mut skipped))
            .unwrap_or_default();

        let last_modified = src
            .property_value(PROP_DATE)
            .map(|raw| parse_ivoa_date(&src.path, raw))
            .transpose()?;

        let mut properties = Vec::new();
        for p in &src.properties {
            if IGNORED_PROPERTIES.contains(&p.key.as_str()) {
                continue;
            }
            match check_uri_reference(&p.key) {
                Ok(()) => properties.push(NodeProperty {
                    key: p.key.clone(),
                    value: p.value.clone(),
                }),
                Err(reason) => {
                    warn!("invalid property uri {} in {}: {}", p.key, src.path, reason);
                    skipped.push(SkippedItem {
                        field: "property",
                        value: p.key.clone(),
                        reason,
                    });
                }
            }
        }

        let parent_id = src.parent_row_id.map(node_id).unwrap_or(self.root_id);

        let node = Node {
            id: node_id(src.row_id),
            name: src.name.clone(),
            parent_id,
            owner_id: src.owner.clone(),
            is_public: src.is_public,
            is_locked: src.is_locked.then_some(true),
            read_only_groups,
            read_write_groups,
            properties,
            last_modified,
            kind,
        };

        Ok(Translation { node, skipped })
    }
}

/// Split a space-separated group list, rewriting `#` to `?`.
fn parse_groups(
    path: &str,
    field: &'static str,
    raw: &str,
    skipped: &mut Vec<SkippedItem>,
) -> BTreeSet<GroupUri> {
    let mut groups = BTreeSet::new();
    for s in raw.split_whitespace() {
        let s = s.replace('#', "?");
        match GroupUri::parse(&s) {
            Ok(g) => {
                groups.insert(g);
            }
            Err(reason) => {
                warn!("skipping {} entry in {}: {}", field, path, reason);
                skipped.push(SkippedItem {
                    field,
                    value: s,
                    reason,
                });
            }
        }
    }
    groups
}

/// Canonicalize a link target: `vos://` authorities use `~` instead of `!`.
///
/// The rest of the target is kept byte for byte.
fn normalize_link_target(path: &str, target: &str) -> Result<String> {
    let invalid = |reason: String| {
        MigrateError::translate(path, format!("invalid link target {}: {}", target, reason))
    };
    check_uri_reference(target).map_err(invalid)?;
    let url = Url::parse(target).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "vos" {
        return Ok(target.to_string());
    }
    if url.host_str().is_none() {
        return Err(invalid("no authority".to_string()));
    }
    let rest = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .ok_or_else(|| invalid("no authority".to_string()))?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    Ok(format!("vos://{}{}", authority.replace('!', "~"), tail))
}

/// Accept an absolute or relative URI reference. Characters a URI cannot
/// carry unescaped, bad `%` escapes and a second `#` are rejected rather
/// than percent-encoded.
fn check_uri_reference(s: &str) -> std::result::Result<(), String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'%' {
            let escaped = bytes
                .get(i + 1..i + 3)
                .map_or(false, |h| h.iter().all(u8::is_ascii_hexdigit));
            if !escaped {
                return Err(format!("malformed escape at index {}", i));
            }
            i += 3;
            continue;
        }
        if b.is_ascii_control() || b == b' ' || br#""<>\^`{|}"#.contains(&b) {
            return Err(format!("illegal character at index {}", i));
        }
        i += 1;
    }
    if s.matches('#').count() > 1 {
        return Err("more than one fragment".to_string());
    }

    match Url::parse(s) {
        Ok(_) => Ok(()),
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse(RELATIVE_BASE)
            .and_then(|base| base.join(s))
            .map(|_| ())
            .map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn parse_ivoa_date(path: &str, raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw.trim(), IVOA_DATE_FORMAT) {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MigrateError::translate(path, format!("invalid timestamp '{}': {}", raw, e)))
}

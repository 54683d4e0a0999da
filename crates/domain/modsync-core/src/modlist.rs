//! Parsing of the server-declared HTML manifest into workshop ids, and the
//! derived identities (folder slug, modset hash) the rest of the daemon
//! keys on.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::{ParsedMod, PollResult, Stage, State};

fn row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<tr[^>]*data-type\s*=\s*"ModContainer"[^>]*>(.*?)</tr>"#)
            .expect("mod container row regex")
    })
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<td[^>]*data-type\s*=\s*"DisplayName"[^>]*>(.*?)</td>"#)
            .expect("display name cell regex")
    })
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a[^>]*data-type\s*=\s*"Link"[^>]*href\s*=\s*"([^"]*)""#)
            .expect("link anchor regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag strip regex"))
}

/// Parse the raw manifest HTML into validated mods. Rows without a decimal
/// `id=` query parameter are skipped and reported through `warn`.
pub fn parse_html_modlist(html: &str, warn: &mut dyn FnMut(String)) -> Vec<ParsedMod> {
    let mut mods = Vec::new();
    for row in row_re().captures_iter(html) {
        let body = &row[1];

        let display_name = match name_re().captures(body) {
            Some(c) => tag_re().replace_all(&c[1], "").trim().to_string(),
            None => {
                warn("modlist row has no display name cell, skipping".to_string());
                continue;
            }
        };
        let href = match link_re().captures(body) {
            Some(c) => c[1].to_string(),
            None => {
                warn(format!("modlist row {display_name:?} has no link, skipping"));
                continue;
            }
        };
        let workshop_id = match workshop_id_from_link(&href) {
            Some(id) => id,
            None => {
                warn(format!(
                    "modlist row {display_name:?} has no numeric workshop id in {href:?}, skipping"
                ));
                continue;
            }
        };

        let folder_slug = slugify_folder(&display_name, &workshop_id);
        mods.push(ParsedMod {
            display_name,
            workshop_id,
            folder_slug,
        });
    }
    mods
}

/// Extract the `id=` query parameter; the value must be purely decimal.
fn workshop_id_from_link(href: &str) -> Option<String> {
    let query = href.split_once('?').map(|(_, q)| q)?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == "id" {
            if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
                return Some(value.to_string());
            }
            return None;
        }
    }
    None
}

/// Filesystem-safe identifier derived from a mod's display name. Lowercased
/// and trimmed; whitespace runs become a single `-`; anything outside
/// `[a-z0-9-]` is dropped; dash runs collapse; a name with nothing left
/// falls back to `mod-<workshop_id>`.
pub fn slugify_folder(display_name: &str, workshop_id: &str) -> String {
    let lowered = display_name.trim().to_lowercase();
    let mut slug = String::with_capacity(lowered.len());
    for ch in lowered.chars() {
        if ch.is_whitespace() || ch == '-' {
            if !slug.ends_with('-') {
                slug.push('-');
            }
        } else if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            slug.push(ch);
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        return format!("mod-{workshop_id}");
    }
    slug
}

/// Hex SHA-256 over the ids sorted ascending and joined with `,`; the
/// identity of a modset, invariant under input order.
pub fn hash_modset(ids: &[String]) -> String {
    let mut sorted = ids.to_vec();
    sorted.sort();
    let joined = sorted.join(",");
    let digest = Sha256::digest(joined.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Merge a successful poll into the state document. Mod rows overwrite only
/// the name-derived fields; a changed modset hash arms the sync pipeline.
pub fn apply_poll_result(state: &mut State, server_id: &str, result: &PollResult) {
    for parsed in &result.mods {
        let entry = state.mods.entry(parsed.workshop_id.clone()).or_default();
        entry.display_name = parsed.display_name.clone();
        entry.folder_slug = parsed.folder_slug.clone();
    }

    let server = state.servers.entry(server_id.to_string()).or_default();
    let previous_hash = std::mem::take(&mut server.last_modset_hash);
    server.last_mod_ids = result.sorted_ids.clone();
    server.last_modset_hash = result.modset_hash.clone();
    if !previous_hash.is_empty() && previous_hash != result.modset_hash {
        server.needs_mod_update = true;
        server.stage = Stage::Planning;
    }
}

//! Read-only workspace reconnaissance for the system prompt.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::io::workspace_fs::relative_slash_path;

const INVENTORY_LIMIT: usize = 5000;
const SCHEMA_SNIFF_BYTES: u64 = 16 * 1024;

const SUMMARY_DIRS: [&str; 8] = [
    "sections",
    "snippets",
    "blocks",
    "templates",
    "layout",
    "assets",
    "config",
    "locales",
];

const ENTRYPOINT_GUESSES: [(&str, &[&str]); 5] = [
    (
        "header",
        &["sections/header.liquid", "sections/main-header.liquid", "snippets/header.liquid"],
    ),
    (
        "footer",
        &["sections/footer.liquid", "sections/main-footer.liquid", "snippets/footer.liquid"],
    ),
    (
        "product",
        &[
            "templates/product.json",
            "templates/product.liquid",
            "sections/main-product.liquid",
            "sections/product-main.liquid",
        ],
    ),
    (
        "collection",
        &[
            "templates/collection.json",
            "templates/collection.liquid",
            "sections/main-collection.liquid",
            "sections/collection-main.liquid",
        ],
    ),
    (
        "cart",
        &[
            "templates/cart.json",
            "templates/cart.liquid",
            "sections/main-cart.liquid",
            "sections/cart-items.liquid",
            "snippets/cart-drawer.liquid",
            "snippets/cart.liquid",
        ],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaStats {
    pub sections_total: usize,
    pub sections_with_schema_like_content: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceSummary {
    pub root: String,
    pub dirs_present: BTreeMap<String, bool>,
    pub file_counts: BTreeMap<String, usize>,
    pub entrypoints: BTreeMap<String, Vec<String>>,
    pub schema_stats: SchemaStats,
    pub notable_files: BTreeMap<String, Option<String>>,
    pub inventory: BTreeMap<String, Vec<String>>,
}

pub fn summarize_workspace(root: &Path) -> WorkspaceSummary {
    let dirs_present = SUMMARY_DIRS
        .iter()
        .map(|d| (d.to_string(), root.join(d).is_dir()))
        .collect();

    let mut inventory = BTreeMap::new();
    inventory.insert("sections".to_string(), list_files(root, "sections", &[".liquid"]));
    inventory.insert("snippets".to_string(), list_files(root, "snippets", &[".liquid"]));
    inventory.insert("blocks".to_string(), list_files(root, "blocks", &[".liquid"]));
    inventory.insert(
        "templates".to_string(),
        list_files(root, "templates", &[".json", ".liquid"]),
    );
    inventory.insert("assets_js".to_string(), list_files(root, "assets", &[".js", ".mjs"]));
    inventory.insert("assets_css".to_string(), list_files(root, "assets", &[".css"]));

    let count_ext = |key: &str, ext: &str| {
        inventory
            .get(key)
            .map(|files: &Vec<String>| files.iter().filter(|f| f.ends_with(ext)).count())
            .unwrap_or(0)
    };
    let mut file_counts = BTreeMap::new();
    file_counts.insert("sections_liquid".to_string(), count_ext("sections", ".liquid"));
    file_counts.insert("snippets_liquid".to_string(), count_ext("snippets", ".liquid"));
    file_counts.insert("blocks_liquid".to_string(), count_ext("blocks", ".liquid"));
    file_counts.insert("templates_json".to_string(), count_ext("templates", ".json"));
    file_counts.insert("templates_liquid".to_string(), count_ext("templates", ".liquid"));
    file_counts.insert("assets_js".to_string(), inventory["assets_js"].len());
    file_counts.insert("assets_css".to_string(), inventory["assets_css"].len());

    let entrypoints = ENTRYPOINT_GUESSES
        .iter()
        .map(|(key, candidates)| {
            let hits = candidates
                .iter()
                .filter(|rel| root.join(rel).is_file())
                .map(|rel| rel.to_string())
                .collect();
            (key.to_string(), hits)
        })
        .collect();

    let sections = &inventory["sections"];
    let schema_stats = SchemaStats {
        sections_total: sections.len(),
        sections_with_schema_like_content: sections
            .iter()
            .filter(|rel| looks_schema_driven(&root.join(rel.as_str())))
            .count(),
    };

    let notable_files = ["config/settings_schema.json", "config/settings_data.json"]
        .iter()
        .map(|rel| {
            let key = rel
                .trim_start_matches("config/")
                .trim_end_matches(".json")
                .to_string();
            (key, root.join(rel).is_file().then(|| rel.to_string()))
        })
        .collect();

    WorkspaceSummary {
        root: root.to_string_lossy().into_owned(),
        dirs_present,
        file_counts,
        entrypoints,
        schema_stats,
        notable_files,
        inventory,
    }
}

/// Required directories absent from `root`, each logged as a warning.
pub fn check_structure(root: &Path, required: &[String]) -> Vec<String> {
    let missing: Vec<String> = required
        .iter()
        .filter(|dir| !root.join(dir.as_str()).is_dir())
        .cloned()
        .collect();
    for dir in &missing {
        warn!(dir = %dir, root = %root.display(), "workspace is missing expected directory");
    }
    missing
}

fn list_files(root: &Path, subdir: &str, exts: &[&str]) -> Vec<String> {
    let base = root.join(subdir);
    if !base.is_dir() {
        return Vec::new();
    }
    let mut out: Vec<String> = WalkDir::new(&base)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| relative_slash_path(root, e.path()))
        .filter(|rel| {
            let lower = rel.to_ascii_lowercase();
            exts.iter().any(|ext| lower.ends_with(ext))
        })
        .take(INVENTORY_LIMIT)
        .collect();
    out.sort();
    out
}

fn looks_schema_driven(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let mut head = Vec::new();
    if file.take(SCHEMA_SNIFF_BYTES).read_to_end(&mut head).is_err() {
        return false;
    }
    let head = String::from_utf8_lossy(&head);
    head.contains("{% schema %}") || head.contains("\"settings\"") || head.contains("\"blocks\"")
}

//! Task Catalog (C2): discovers, filters, and renders tasks from an on-disk directory tree
//! shaped `<root>/<service>/<category>/<name>/{description.md,verify.*,meta.json}`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::model::{ServiceName, Task, TaskMeta};

/// Problems while discovering or rendering a task that are not "task is simply ill-formed,
/// skip it" — these stop catalog loading outright.
#[derive(Debug, Clone)]
pub enum CatalogError {
    Io(String),
    Json(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(msg) => write!(f, "catalog io error: {msg}"),
            CatalogError::Json(msg) => write!(f, "catalog meta.json error: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// A discrepancy between a task description's placeholders and the locators available at
/// render time.
#[derive(Debug, Clone)]
pub struct TemplateError {
    pub missing: Vec<String>,
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "description references unresolved placeholders: {}",
            self.missing.join(", ")
        )
    }
}

impl std::error::Error for TemplateError {}

/// Selects a subset of the catalog. `Service`/`Category`/`Exact` narrow progressively; an
/// unknown service or category yields an empty result rather than an error, matching the
/// original catalog's "filtering is a view, not a validation step" behaviour.
#[derive(Debug, Clone)]
pub enum TaskFilter {
    All,
    Service(ServiceName),
    Category(ServiceName, String),
    Exact(ServiceName, String, String),
}

impl TaskFilter {
    fn matches(&self, service: ServiceName, category: &str, name: &str) -> bool {
        match self {
            TaskFilter::All => true,
            TaskFilter::Service(s) => *s == service,
            TaskFilter::Category(s, c) => *s == service && c == category,
            TaskFilter::Exact(s, c, n) => *s == service && c == category && n == name,
        }
    }
}

/// An unrendered catalog entry: the raw description template plus its meta, before locators
/// from state preparation are known.
pub struct RawTask {
    pub service: ServiceName,
    pub category: String,
    pub name: String,
    pub root: PathBuf,
    pub description_template: String,
    pub meta: TaskMeta,
}

/// Walk `catalog_root` and return every well-formed task directory, skipping (with a
/// `log::warn!`) anything missing `description.md`, a `verify.*` file, or `meta.json`.
pub fn discover(catalog_root: &Path) -> Result<Vec<RawTask>, CatalogError> {
    let mut tasks = Vec::new();

    // Expected depth: <root>/<service>/<category>/<name>/
    for entry in WalkDir::new(catalog_root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
    {
        let dir = entry.path();
        let name = match dir.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };
        let category = match dir.parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()) {
            Some(c) => c.to_string(),
            None => continue,
        };
        let service_str = match dir
            .parent()
            .and_then(|p| p.parent())
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
        {
            Some(s) => s.to_string(),
            None => continue,
        };
        let service: ServiceName = match service_str.parse() {
            Ok(s) => s,
            Err(_) => {
                log::warn!("skipping catalog entry under unknown service '{service_str}'");
                continue;
            }
        };

        let description_path = dir.join("description.md");
        let meta_path = dir.join("meta.json");
        let has_verifier = std::fs::read_dir(dir)
            .map(|mut rd| {
                rd.any(|e| {
                    e.ok()
                        .map(|e| {
                            e.file_name()
                                .to_str()
                                .map(|n| n.starts_with("verify."))
                                .unwrap_or(false)
                        })
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        if !description_path.is_file() || !meta_path.is_file() || !has_verifier {
            log::warn!(
                "skipping ill-formed catalog entry {}/{}/{name}: missing description.md, verify.*, or meta.json",
                service, category
            );
            continue;
        }

        let description_template = match std::fs::read_to_string(&description_path) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("skipping {name}: failed to read description.md: {e}");
                continue;
            }
        };

        let meta_raw = match std::fs::read_to_string(&meta_path) {
            Ok(s) => s,
            Err(e) => return Err(CatalogError::Io(e.to_string())),
        };
        let meta: TaskMeta = match serde_json::from_str(&meta_raw) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("skipping {name}: malformed meta.json: {e}");
                continue;
            }
        };

        tasks.push(RawTask {
            service,
            category,
            name,
            root: dir.to_path_buf(),
            description_template,
            meta,
        });
    }

    Ok(tasks)
}

/// Apply a [`TaskFilter`] to a set of raw catalog entries.
pub fn filter<'a>(tasks: &'a [RawTask], filter: &TaskFilter) -> Vec<&'a RawTask> {
    tasks
        .iter()
        .filter(|t| filter.matches(t.service, &t.category, &t.name))
        .collect()
}

/// Substitute `{{PLACEHOLDER}}` tokens in a description using the locators produced by state
/// preparation. A template with zero placeholders falls back to [`render_legacy_fallback`]
/// rather than being returned unmodified, matching older catalog entries authored before the
/// templating convention existed.
pub fn render(
    description_template: &str,
    locators: &HashMap<String, String>,
) -> Result<String, TemplateError> {
    if !description_template.contains("{{") {
        return Ok(render_legacy_fallback(description_template, locators));
    }

    let mut missing = Vec::new();
    let mut out = String::with_capacity(description_template.len());
    let mut rest = description_template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_start = &rest[start + 2..];
        match after_start.find("}}") {
            Some(end) => {
                let key = after_start[..end].trim();
                match locators.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        missing.push(key.to_string());
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after_start[end + 2..];
            }
            None => {
                // Unterminated `{{` — emit the rest verbatim and stop scanning.
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(TemplateError { missing })
    }
}

/// Compatibility path for catalog entries authored before the `{{PLACEHOLDER}}` templating
/// convention existed: prepend a preamble listing the available locators instead of failing.
/// New catalog entries should use explicit placeholders; this exists only so older task
/// directories keep working unmodified.
pub fn render_legacy_fallback(
    description: &str,
    locators: &HashMap<String, String>,
) -> String {
    if locators.is_empty() {
        return description.to_string();
    }
    let mut preamble = String::from("Context:\n");
    let mut keys: Vec<_> = locators.keys().collect();
    keys.sort();
    for key in keys {
        preamble.push_str(&format!("- {key}: {}\n", locators[key]));
    }
    preamble.push('\n');
    preamble.push_str(description);
    preamble
}

/// Turn a [`RawTask`] into the immutable [`Task`] a `RunContext` carries for the lifetime of a
/// run. The description stays a template here: it is rendered per-run by the pipeline once
/// `StateManager::set` has produced that run's actual locators (§4.2.3), since a locator such as
/// a Notion page id is unique per run and unknown at catalog-load time.
pub fn materialize(raw: &RawTask) -> Task {
    Task {
        service: raw.service,
        category: raw.category.clone(),
        name: raw.name.clone(),
        root: raw.root.clone(),
        description_template: raw.description_template.clone(),
        meta: raw.meta.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locators(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_substitutes_known_placeholders() {
        let out = render(
            "Edit the page {{PAGE_ID}} in workspace {{WORKSPACE}}.",
            &locators(&[("PAGE_ID", "abc123"), ("WORKSPACE", "Eval Hub")]),
        )
        .unwrap();
        assert_eq!(out, "Edit the page abc123 in workspace Eval Hub.");
    }

    #[test]
    fn render_reports_missing_placeholders() {
        let err = render("Edit {{PAGE_ID}}.", &locators(&[])).unwrap_err();
        assert_eq!(err.missing, vec!["PAGE_ID".to_string()]);
    }

    #[test]
    fn render_falls_back_for_plain_descriptions() {
        let out = render(
            "Create a table with three columns.",
            &locators(&[("test_directory", "/tmp/x")]),
        )
        .unwrap();
        assert!(out.contains("test_directory"));
        assert!(out.contains("Create a table with three columns."));
    }

    #[test]
    fn filter_exact_narrows_to_one_task() {
        let tasks = vec![
            RawTask {
                service: ServiceName::Filesystem,
                category: "files".to_string(),
                name: "copy".to_string(),
                root: PathBuf::from("/tmp/a"),
                description_template: String::new(),
                meta: TaskMeta {
                    category_id: 1,
                    category_name: "Files".to_string(),
                    tags: vec![],
                    timeout_seconds: 60,
                    extra: Default::default(),
                },
            },
            RawTask {
                service: ServiceName::Filesystem,
                category: "files".to_string(),
                name: "rename".to_string(),
                root: PathBuf::from("/tmp/b"),
                description_template: String::new(),
                meta: TaskMeta {
                    category_id: 1,
                    category_name: "Files".to_string(),
                    tags: vec![],
                    timeout_seconds: 60,
                    extra: Default::default(),
                },
            },
        ];
        let f = TaskFilter::Exact(ServiceName::Filesystem, "files".to_string(), "copy".to_string());
        let matched = filter(&tasks, &f);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "copy");
    }

    #[test]
    fn filter_unknown_category_yields_empty() {
        let tasks: Vec<RawTask> = vec![];
        let f = TaskFilter::Category(ServiceName::Github, "nonexistent".to_string());
        assert!(filter(&tasks, &f).is_empty());
    }
}

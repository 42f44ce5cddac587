//! Hierarchy path handling for the `_bk_iam_path_` attribute.
//!
//! A path looks like `/biz,1/set,2/module,3/`: a chain of `type,id` nodes.
//! Two decompositions are used by the document engine: the prefix set (every
//! ancestor plus wildcard-id ancestors) backs `starts_with` lookups, and the
//! node set backs `string_contains` lookups via a companion field.

/// Field suffix that marks a hierarchy-path attribute, e.g.
/// `host._bk_iam_path_`.
pub const PATH_SUFFIX: &str = "._bk_iam_path_";
/// The bare attribute key on a resource node.
pub const PATH_KEY: &str = "_bk_iam_path_";
/// Companion attribute key holding the node decomposition.
pub const PATH_CONTAINS_KEY: &str = "_bk_iam_path_contains_";

pub fn is_path_field(field: &str) -> bool {
    field.ends_with(PATH_SUFFIX)
}

/// Rewrites `x._bk_iam_path_` into `x._bk_iam_path_contains_`.
pub fn to_contains_field(field: &str) -> String {
    match field.strip_suffix(PATH_SUFFIX) {
        Some(object) => format!("{object}.{PATH_CONTAINS_KEY}"),
        None => field.to_string(),
    }
}

/// Expands a path into its prefix set: the ancestor chain plus, for every
/// prefix of depth >= 2, the same prefix with the last node's id wildcarded.
///
/// `/biz,1/set,2/` => `[/biz,1/, /biz,1/set,2/, /biz,1/set,*/]`
pub fn split_path_prefixes(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }

    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }

    let parts: Vec<&str> = trimmed.split('/').collect();
    let mut results = Vec::with_capacity(parts.len() * 2);
    for i in 1..=parts.len() {
        let prefix = parts[..i].join("/");
        results.push(format!("/{prefix}/"));

        if i > 1 {
            if let Some(comma) = prefix.rfind(',') {
                results.push(format!("/{},*/", &prefix[..comma]));
            }
        }
    }
    results
}

/// Splits a path into its individual nodes: `/biz,1/set,2/` =>
/// `[/biz,1/, /set,2/]`.
pub fn split_path_nodes(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }

    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() {
        return Vec::new();
    }

    trimmed.split('/').map(|part| format!("/{part}/")).collect()
}

//! Pipeline label rendering.

use crate::material::MaterialRevisions;
use regex::Regex;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{\s*([^}\[\s]+)\s*(?:\[:(\d+)\])?\s*\}").ok());

/// Render a label template for a new pipeline instance.
///
/// Supports:
/// - `${COUNT}` - the pipeline counter
/// - `${name}` - latest revision of the material with that display name
/// - `${name[:7]}` - the same revision truncated to 7 characters
///
/// Unknown placeholders are left untouched.
pub fn render(template: &str, counter: u32, revisions: &MaterialRevisions) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.replace("${COUNT}", &counter.to_string());
    };

    re.replace_all(template, |caps: &regex::Captures| {
        let key = caps.get(1).map_or("", |m| m.as_str());
        let truncate = caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok());

        let value = if key.eq_ignore_ascii_case("COUNT") {
            Some(counter.to_string())
        } else {
            revisions
                .iter()
                .find(|r| r.material.name() == key)
                .and_then(|r| r.latest_revision())
                .map(str::to_string)
        };

        match (value, truncate) {
            (Some(value), Some(len)) => value.chars().take(len).collect(),
            (Some(value), None) => value,
            (None, _) => caps[0].to_string(),
        }
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material::{Material, MaterialRevision, Modification};
    use chrono::Utc;

    fn revisions() -> MaterialRevisions {
        MaterialRevisions::new(vec![MaterialRevision::new(
            Material::scm("https://git/g1").named("g1"),
            vec![Modification::new("a1b2c3d4e5f6", Utc::now())],
        )])
    }

    #[test]
    fn test_count() {
        assert_eq!(render("${COUNT}", 7, &revisions()), "7");
        assert_eq!(render("1.0.${count}", 7, &revisions()), "1.0.7");
    }

    #[test]
    fn test_material_revision() {
        assert_eq!(render("${COUNT}-${g1}", 3, &revisions()), "3-a1b2c3d4e5f6");
        assert_eq!(render("${COUNT}-${g1[:6]}", 3, &revisions()), "3-a1b2c3");
    }

    #[test]
    fn test_unknown_placeholder_kept() {
        assert_eq!(render("${COUNT}-${nope}", 3, &revisions()), "3-${nope}");
    }
}

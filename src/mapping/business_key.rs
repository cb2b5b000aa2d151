//! Business-key generation from recipe declarations.

use std::collections::BTreeMap;

use crate::config::BusinessKeyRecipe;

/// Generate the business key for one normalized row. Deterministic: the same
/// values always produce the same key. Missing parts substitute empty
/// strings; parts are joined by underscores with case preserved.
pub fn generate(recipe: &BusinessKeyRecipe, values: &BTreeMap<String, Option<String>>) -> String {
    let parts = select_parts(recipe, values);
    parts
        .iter()
        .map(|part| {
            values
                .get(part.as_str())
                .and_then(|v| v.as_deref())
                .unwrap_or("")
        })
        .collect::<Vec<_>>()
        .join("_")
}

fn select_parts<'a>(
    recipe: &'a BusinessKeyRecipe,
    values: &BTreeMap<String, Option<String>>,
) -> &'a [String] {
    if let Some(discriminator) = &recipe.discriminator {
        let value = values
            .get(discriminator.as_str())
            .and_then(|v| v.as_deref())
            .unwrap_or("");
        for case in &recipe.cases {
            if case.when.iter().any(|w| w == value) {
                return &case.parts;
            }
        }
    }
    &recipe.default.parts
}

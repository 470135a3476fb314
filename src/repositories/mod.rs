pub(crate) mod annotations;
pub(crate) mod assignments;
pub(crate) mod essays;
pub(crate) mod grading_results;
pub(crate) mod rubrics;

/// Prefixes each name in a `COLUMNS` list with a table alias.
pub(crate) fn qualified(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

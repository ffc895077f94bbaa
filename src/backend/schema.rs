use tracing::info;

use crate::error::StoreError;

use super::DataAccess;

/// Bumped whenever the bundled deploy scripts change shape. Not yet
/// consulted for in-place migration — first deploy always creates the
/// current shape from scratch.
pub const SCHEMA_VERSION: u32 = 1;

/// Ensures the schema exists, deploying it from the bundled script on first
/// use. A prefix is baked into the script text at deploy time via the same
/// `{}`-rewriting `DataAccess` uses for every other statement.
pub(crate) async fn ensure_deployed(dao: &DataAccess) -> Result<(), StoreError> {
    if dao.schema_present().await? {
        return Ok(());
    }

    let statements = split_statements(dao.deploy_script());
    dao.execute_in_transaction(move |dao| {
        Box::pin(async move {
            for statement in &statements {
                dao.raw_execute(statement, &[]).await?;
            }
            Ok(())
        })
    })
    .await?;
    info!(dialect = ?dao.dialect(), "deployed schema");
    Ok(())
}

/// Strips `--`-prefixed comment lines and splits the script into individual
/// statements on `;`. Intentionally naive — the bundled scripts never embed
/// a semicolon inside a string literal.
fn split_statements(script: &str) -> Vec<String> {
    script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comments_and_splits_on_semicolon() {
        let script = "-- a comment\nCREATE TABLE a (id INT);\nCREATE TABLE b (id INT);\n";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE a"));
        assert!(statements[1].contains("CREATE TABLE b"));
    }
}

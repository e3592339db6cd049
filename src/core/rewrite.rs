/// Database name substitution inside SQL dumps
///
/// A dump taken with a `CREATE DATABASE` preamble names its source database
/// in the preamble and in qualified identifiers. Restoring into another name
/// rewrites exactly those occurrences: `` `src`. `` prefixes, and the quoted
/// name in `CREATE DATABASE` / `ALTER DATABASE` / `USE` statements. An
/// identifier that merely contains the source name is left alone.

use regex::bytes::{Captures, NoExpand, Regex};
use std::borrow::Cow;
use std::io::{self, BufRead};
use std::sync::OnceLock;

use crate::core::engine::quote_identifier;

/// Lines read from the top of a dump while looking for its database name
const PREAMBLE_SCAN_LINES: usize = 200;

fn preamble_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:CREATE\s+DATABASE\b[^`]*|USE\s+)`([^`]+)`")
            .expect("preamble pattern is valid")
    })
}

/// Database name from a single `CREATE DATABASE` or `USE` line
pub fn embedded_database(line: &[u8]) -> Option<String> {
    preamble_pattern()
        .captures(line)
        .map(|caps| String::from_utf8_lossy(&caps[1]).to_string())
}

/// Scan the start of a dump for the database it was taken from
pub fn detect_source_database<R: BufRead>(mut reader: R) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    for _ in 0..PREAMBLE_SCAN_LINES {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if let Some(name) = embedded_database(&line) {
            return Ok(Some(name));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone)]
pub struct NameRewrite {
    source: String,
    target: String,
    qualified: Regex,
    statement: Regex,
}

impl NameRewrite {
    pub fn new(source: &str, target: &str) -> Self {
        let quoted = regex::escape(&quote_identifier(source));
        // Both patterns are built from an escaped literal, so they always compile
        let qualified = Regex::new(&format!(r"{}\.", quoted)).expect("escaped identifier pattern");
        // mysqldump brackets routines and triggers with ALTER DATABASE when their collation differs
        let statement = Regex::new(&format!(
            r"(?i)^(\s*(?:/\*!\d+\s+)?(?:(?:CREATE|ALTER)\s+DATABASE\b[^`]*|USE\s+)){}",
            quoted
        ))
        .expect("escaped statement pattern");

        Self {
            source: source.to_string(),
            target: target.to_string(),
            qualified,
            statement,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Rewrite one line, borrowing it unchanged when nothing matches
    pub fn apply<'a>(&self, line: &'a [u8]) -> Cow<'a, [u8]> {
        let quoted_target = quote_identifier(&self.target);

        let line = self.statement.replace(line, |caps: &Captures| {
            let mut out = caps[1].to_vec();
            out.extend_from_slice(quoted_target.as_bytes());
            out
        });

        if !self.qualified.is_match(&line) {
            return line;
        }
        let replacement = format!("{}.", quoted_target);
        Cow::Owned(self.qualified.replace_all(&line, NoExpand(replacement.as_bytes())).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(line: &str) -> String {
        let rw = NameRewrite::new("shipping", "shipping_copy");
        String::from_utf8(rw.apply(line.as_bytes()).into_owned()).unwrap()
    }

    #[test]
    fn test_rewrites_preamble() {
        assert_eq!(
            rewrite("CREATE DATABASE /*!32312 IF NOT EXISTS*/ `shipping` /*!40100 DEFAULT CHARACTER SET utf8mb4 */;\n"),
            "CREATE DATABASE /*!32312 IF NOT EXISTS*/ `shipping_copy` /*!40100 DEFAULT CHARACTER SET utf8mb4 */;\n"
        );
        assert_eq!(rewrite("USE `shipping`;\n"), "USE `shipping_copy`;\n");
    }

    #[test]
    fn test_rewrites_alter_database() {
        assert_eq!(
            rewrite("ALTER DATABASE `shipping` CHARACTER SET utf8mb4 COLLATE utf8mb4_0900_ai_ci ;\n"),
            "ALTER DATABASE `shipping_copy` CHARACTER SET utf8mb4 COLLATE utf8mb4_0900_ai_ci ;\n"
        );
        assert_eq!(
            rewrite("/*!50003 ALTER DATABASE `shipping` CHARACTER SET latin1 COLLATE latin1_swedish_ci */ ;"),
            "/*!50003 ALTER DATABASE `shipping_copy` CHARACTER SET latin1 COLLATE latin1_swedish_ci */ ;"
        );
        assert_eq!(
            rewrite("ALTER DATABASE `shipping_archive` CHARACTER SET latin1 ;"),
            "ALTER DATABASE `shipping_archive` CHARACTER SET latin1 ;"
        );
    }

    #[test]
    fn test_rewrites_qualified_references() {
        assert_eq!(
            rewrite("INSERT INTO `shipping`.`users` SELECT * FROM `shipping`.`staff`;"),
            "INSERT INTO `shipping_copy`.`users` SELECT * FROM `shipping_copy`.`staff`;"
        );
    }

    #[test]
    fn test_leaves_longer_identifiers_alone() {
        let line = "INSERT INTO `shipping_archive`.`users` VALUES ('shipping');";
        assert_eq!(rewrite(line), line);
        assert!(matches!(
            NameRewrite::new("shipping", "x").apply(line.as_bytes()),
            Cow::Borrowed(_)
        ));
        assert_eq!(rewrite("CREATE TABLE `shipping` (`id` int);"), "CREATE TABLE `shipping` (`id` int);");
    }

    #[test]
    fn test_dollar_in_target_is_literal() {
        let rw = NameRewrite::new("shipping", "ship$1");
        let out = rw.apply(b"USE `shipping`; SELECT * FROM `shipping`.`t`;");
        assert_eq!(&*out, &b"USE `ship$1`; SELECT * FROM `ship$1`.`t`;"[..]);
    }

    #[test]
    fn test_detect_source_database() {
        let dump = "-- MySQL dump\n--\n\nCREATE DATABASE /*!32312 IF NOT EXISTS*/ `shipping`;\nUSE `shipping`;\n";
        assert_eq!(detect_source_database(dump.as_bytes()).unwrap().as_deref(), Some("shipping"));

        let bare = "CREATE TABLE `t` (`id` int);\nINSERT INTO `t` VALUES (1);\n";
        assert_eq!(detect_source_database(bare.as_bytes()).unwrap(), None);
    }
}

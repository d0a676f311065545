//! Statement classification by leading keyword.

use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatementKind {
    /// Catalog listing (`TABLES ...`). Not supported by the bridge.
    CatalogListing,
    /// `INSERT`, `UPDATE`, `DELETE`: answered with an affected-row count.
    RowCount,
    /// Everything else, shaped by the columns it returns.
    Rows,
}

impl StatementKind {
    pub fn of(sql: &str) -> Self {
        match leading_keyword(sql) {
            Some(Keyword::TABLES) => StatementKind::CatalogListing,
            Some(Keyword::INSERT | Keyword::UPDATE | Keyword::DELETE) => StatementKind::RowCount,
            _ => StatementKind::Rows,
        }
    }
}

/// First keyword of `sql`, skipping whitespace and comments.
///
/// Text the tokenizer rejects (an unterminated literal further on, say) falls
/// back to the first alphabetic word so it still reaches the engine, which
/// reports the real error.
fn leading_keyword(sql: &str) -> Option<Keyword> {
    let dialect = GenericDialect {};
    match Tokenizer::new(&dialect, sql).tokenize() {
        Ok(tokens) => tokens.into_iter().find_map(|token| match token {
            Token::Whitespace(_) => None,
            Token::Word(word) => Some(Some(word.keyword)),
            _ => Some(None),
        })?,
        Err(_) => {
            let word: String = sql
                .trim_start()
                .chars()
                .take_while(char::is_ascii_alphabetic)
                .collect();
            match word.to_ascii_uppercase().as_str() {
                "TABLES" => Some(Keyword::TABLES),
                "INSERT" => Some(Keyword::INSERT),
                "UPDATE" => Some(Keyword::UPDATE),
                "DELETE" => Some(Keyword::DELETE),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_report_row_counts() {
        assert_eq!(StatementKind::of("insert into t values (1)"), StatementKind::RowCount);
        assert_eq!(StatementKind::of("UPDATE t SET a = 1"), StatementKind::RowCount);
        assert_eq!(StatementKind::of("  \n\tDelete from t"), StatementKind::RowCount);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            StatementKind::of("-- bump\nupdate t set a = a + 1"),
            StatementKind::RowCount
        );
        assert_eq!(
            StatementKind::of("/* list */ tables"),
            StatementKind::CatalogListing
        );
    }

    #[test]
    fn everything_else_returns_rows() {
        assert_eq!(StatementKind::of("select 1"), StatementKind::Rows);
        assert_eq!(StatementKind::of("create table t (a int)"), StatementKind::Rows);
        assert_eq!(StatementKind::of("(select 1)"), StatementKind::Rows);
        assert_eq!(StatementKind::of(""), StatementKind::Rows);
    }

    #[test]
    fn untokenizable_text_falls_back_to_first_word() {
        assert_eq!(
            StatementKind::of("insert into t values ('unterminated"),
            StatementKind::RowCount
        );
        assert_eq!(StatementKind::of("select 'oops"), StatementKind::Rows);
    }
}

//! Rule-based DDL translation from the embedded dialect.
//!
//! Rules are word sequences matched whole-word and case-insensitively. Text
//! inside quoted literals and identifiers is never rewritten, so a column
//! named `"blob"` survives while a `BLOB` type becomes `BYTEA` on Postgres.
//! Longer patterns are listed before their prefixes.
//!
//! Rewrites that depend on what a column is, rather than on how it is spelled,
//! come from a pass over the parsed column list: MySQL cannot index `TEXT`, so
//! every key column declared `TEXT` becomes `VARCHAR(255)` whether the key is
//! inline or a table constraint, and Postgres boolean columns get `TRUE` or
//! `FALSE` defaults in place of `1` and `0`.

use std::collections::{HashMap, HashSet};

use keel_core::Engine;

/// Table options appended to every MySQL table.
pub const MYSQL_TABLE_OPTIONS: &str = "ENGINE=InnoDB DEFAULT CHARSET=utf8mb4";

/// Type given to MySQL key columns declared `TEXT`.
const MYSQL_KEY_TEXT: &str = "VARCHAR(255)";

struct Rule {
    pattern: &'static [&'static str],
    replacement: &'static str,
}

const fn rule(pattern: &'static [&'static str], replacement: &'static str) -> Rule {
    Rule {
        pattern,
        replacement,
    }
}

const COMMON_RULES: &[Rule] = &[
    rule(
        &["CREATE", "TABLE", "IF", "NOT", "EXISTS"],
        "CREATE TABLE IF NOT EXISTS",
    ),
    rule(&["CREATE", "TABLE"], "CREATE TABLE IF NOT EXISTS"),
    rule(&["WITHOUT", "ROWID"], ""),
    rule(&["STRICT"], ""),
];

// SQLite integers are 64-bit whatever the declared name, and an
// `INTEGER PRIMARY KEY` column is assigned automatically.
const POSTGRES_RULES: &[Rule] = &[
    rule(
        &["INTEGER", "PRIMARY", "KEY", "AUTOINCREMENT"],
        "BIGSERIAL PRIMARY KEY",
    ),
    rule(&["INTEGER", "PRIMARY", "KEY"], "BIGSERIAL PRIMARY KEY"),
    rule(&["AUTOINCREMENT"], ""),
    rule(&["INTEGER"], "BIGINT"),
    rule(&["INT"], "BIGINT"),
    rule(&["DATETIME"], "TIMESTAMP"),
    rule(&["BLOB"], "BYTEA"),
    rule(&["DOUBLE", "PRECISION"], "DOUBLE PRECISION"),
    rule(&["DOUBLE"], "DOUBLE PRECISION"),
    rule(&["REAL"], "DOUBLE PRECISION"),
];

const MYSQL_RULES: &[Rule] = &[
    rule(
        &["INTEGER", "PRIMARY", "KEY", "AUTOINCREMENT"],
        "BIGINT PRIMARY KEY AUTO_INCREMENT",
    ),
    rule(
        &["INTEGER", "PRIMARY", "KEY"],
        "BIGINT PRIMARY KEY AUTO_INCREMENT",
    ),
    rule(&["AUTOINCREMENT"], "AUTO_INCREMENT"),
    rule(&["INTEGER"], "BIGINT"),
    rule(&["INT"], "BIGINT"),
    rule(&["BOOLEAN"], "TINYINT(1)"),
];

fn engine_rules(target: Engine) -> &'static [Rule] {
    match target {
        Engine::Postgres => POSTGRES_RULES,
        Engine::MySql => MYSQL_RULES,
        Engine::Sqlite => &[],
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_quote(c: char) -> bool {
    c == '\'' || c == '"' || c == '`'
}

fn word_end(chars: &[char], start: usize) -> usize {
    let mut end = start;
    while end < chars.len() && is_word_char(chars[end]) {
        end += 1;
    }
    end
}

/// End of the quoted span opening at `start`. Doubled quotes are escapes.
fn quoted_end(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}

/// Match `rule` at `start`, returning the index just past the last word.
fn match_rule(chars: &[char], start: usize, rule: &Rule) -> Option<usize> {
    let mut pos = start;
    for (n, word) in rule.pattern.iter().enumerate() {
        if n > 0 {
            let gap = pos;
            while pos < chars.len() && chars[pos].is_whitespace() {
                pos += 1;
            }
            if pos == gap {
                return None;
            }
        }

        let end = word_end(chars, pos);
        if end == pos {
            return None;
        }
        let candidate: String = chars[pos..end].iter().collect();
        if !candidate.eq_ignore_ascii_case(word) {
            return None;
        }
        pos = end;
    }
    Some(pos)
}

/// A word or quoted span, as `start..end` indices.
type Token = (usize, usize);

/// First `(` in `chars[start..end]` outside quoted spans.
fn first_open(chars: &[char], start: usize, end: usize) -> Option<usize> {
    let mut i = start;
    while i < end {
        match chars[i] {
            c if is_quote(c) => i = quoted_end(chars, i),
            '(' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// The `)` closing the `(` at `open`.
fn matching_close(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            c if is_quote(c) => {
                i = quoted_end(chars, i);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split `chars[start..end]` at commas outside parentheses and quotes.
fn split_top_level(chars: &[char], start: usize, end: usize) -> Vec<(usize, usize)> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut from = start;
    let mut i = start;
    while i < end {
        match chars[i] {
            c if is_quote(c) => {
                i = quoted_end(chars, i).min(end);
                continue;
            }
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push((from, i));
                from = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push((from, end));
    parts
}

/// Words and quoted spans of `chars[start..end]` outside parentheses.
fn tokens(chars: &[char], start: usize, end: usize) -> Vec<Token> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut i = start;
    while i < end {
        let c = chars[i];
        let close = if is_quote(c) {
            quoted_end(chars, i).min(end)
        } else if is_word_char(c) {
            word_end(chars, i).min(end)
        } else {
            match c {
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                _ => {}
            }
            i += 1;
            continue;
        };
        if depth == 0 {
            out.push((i, close));
        }
        i = close;
    }
    out
}

fn token_text(chars: &[char], (start, end): Token) -> String {
    chars[start..end].iter().collect()
}

fn is_keyword(chars: &[char], token: Token, keyword: &str) -> bool {
    is_word_char(chars[token.0]) && token_text(chars, token).eq_ignore_ascii_case(keyword)
}

/// Column name held by `token`, unquoted and lowercased.
fn ident(chars: &[char], token: Token) -> String {
    let raw = token_text(chars, token);
    let quote = chars[token.0];
    let name = if is_quote(quote) && raw.len() >= 2 && raw.ends_with(quote) {
        let doubled: String = [quote, quote].iter().collect();
        raw[1..raw.len() - 1].replace(&doubled, &quote.to_string())
    } else {
        raw
    };
    name.to_ascii_lowercase()
}

/// One entry of a `CREATE TABLE` column list.
enum TableItem {
    Column { name: String, rest: Vec<Token> },
    Key(Vec<String>),
    Other,
}

fn classify(chars: &[char], start: usize, end: usize) -> TableItem {
    let all = tokens(chars, start, end);
    let named = all
        .first()
        .is_some_and(|t| is_keyword(chars, *t, "CONSTRAINT"));
    let toks = if named { all.get(2..).unwrap_or(&[]) } else { &all[..] };

    let Some(&first) = toks.first() else {
        return TableItem::Other;
    };
    if is_keyword(chars, first, "PRIMARY") || is_keyword(chars, first, "UNIQUE") {
        let columns = first_open(chars, first.1, end)
            .and_then(|open| matching_close(chars, open).map(|close| (open, close)))
            .map(|(open, close)| {
                split_top_level(chars, open + 1, close)
                    .into_iter()
                    .filter_map(|(s, e)| tokens(chars, s, e).first().map(|t| ident(chars, *t)))
                    .collect()
            })
            .unwrap_or_default();
        return TableItem::Key(columns);
    }
    if named || is_keyword(chars, first, "CHECK") || is_keyword(chars, first, "FOREIGN") {
        return TableItem::Other;
    }

    TableItem::Column {
        name: ident(chars, first),
        rest: toks[1..].to_vec(),
    }
}

/// Replacements keyed by start index, each with the end of the replaced span.
fn column_rewrites(chars: &[char], target: Engine) -> HashMap<usize, (usize, &'static str)> {
    let mut rewrites = HashMap::new();
    if target == Engine::Sqlite {
        return rewrites;
    }
    let Some(open) = first_open(chars, 0, chars.len()) else {
        return rewrites;
    };
    let Some(close) = matching_close(chars, open) else {
        return rewrites;
    };

    let items: Vec<TableItem> = split_top_level(chars, open + 1, close)
        .into_iter()
        .map(|(start, end)| classify(chars, start, end))
        .collect();
    let keys: HashSet<&str> = items
        .iter()
        .filter_map(|item| match item {
            TableItem::Key(columns) => Some(columns),
            _ => None,
        })
        .flatten()
        .map(String::as_str)
        .collect();

    for item in &items {
        let TableItem::Column { name, rest } = item else {
            continue;
        };
        let Some(&ty) = rest.first() else {
            continue;
        };

        match target {
            Engine::MySql if is_keyword(chars, ty, "TEXT") => {
                let inline_key = rest.iter().any(|t| is_keyword(chars, *t, "UNIQUE"))
                    || rest.windows(2).any(|w| {
                        is_keyword(chars, w[0], "PRIMARY") && is_keyword(chars, w[1], "KEY")
                    });
                if inline_key || keys.contains(name.as_str()) {
                    rewrites.insert(ty.0, (ty.1, MYSQL_KEY_TEXT));
                }
            }
            Engine::Postgres if is_keyword(chars, ty, "BOOLEAN") => {
                for w in rest.windows(2) {
                    if !is_keyword(chars, w[0], "DEFAULT") {
                        continue;
                    }
                    match token_text(chars, w[1]).as_str() {
                        "1" => rewrites.insert(w[1].0, (w[1].1, "TRUE")),
                        "0" => rewrites.insert(w[1].0, (w[1].1, "FALSE")),
                        _ => None,
                    };
                }
            }
            _ => {}
        }
    }
    rewrites
}

/// Rewrite a `CREATE TABLE` statement read from the embedded catalog into the
/// `target` dialect.
pub fn translate_ddl(ddl: &str, target: Engine) -> String {
    let source = ddl.trim().trim_end_matches(';');
    let chars: Vec<char> = source.chars().collect();
    let rules = engine_rules(target);
    let rewrites = column_rewrites(&chars, target);
    let mut out = String::with_capacity(source.len() + MYSQL_TABLE_OPTIONS.len() + 16);

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];

        if let Some(&(end, replacement)) = rewrites.get(&i) {
            out.push_str(replacement);
            i = end;
            continue;
        }

        if is_quote(c) {
            let end = quoted_end(&chars, i);
            if target == Engine::MySql && c == '"' {
                let inner: String = chars[i + 1..end.saturating_sub(1).max(i + 1)]
                    .iter()
                    .collect();
                out.push('`');
                out.push_str(&inner.replace("\"\"", "\"").replace('`', "``"));
                out.push('`');
            } else {
                out.extend(&chars[i..end]);
            }
            i = end;
            continue;
        }

        if is_word_char(c) {
            let matched = COMMON_RULES
                .iter()
                .chain(rules.iter())
                .find_map(|rule| match_rule(&chars, i, rule).map(|end| (rule, end)));

            match matched {
                Some((rule, end)) => {
                    out.push_str(rule.replacement);
                    i = end;
                    if rule.replacement.is_empty() {
                        while i < chars.len() && chars[i].is_whitespace() {
                            i += 1;
                        }
                    }
                }
                None => {
                    let end = word_end(&chars, i);
                    out.extend(&chars[i..end]);
                    i = end;
                }
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    // Dropped table options can leave a dangling separator.
    let mut translated = out
        .trim_end_matches(|c: char| c.is_whitespace() || c == ',')
        .to_string();

    if target == Engine::MySql && !translated.to_ascii_uppercase().contains("ENGINE=") {
        translated.push(' ');
        translated.push_str(MYSQL_TABLE_OPTIONS);
    }
    translated
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMINS: &str = "CREATE TABLE admins (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                          username TEXT NOT NULL UNIQUE, \
                          is_active BOOLEAN NOT NULL DEFAULT 1, \
                          created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP)";

    #[test]
    fn test_postgres_translation() {
        let ddl = translate_ddl(ADMINS, Engine::Postgres);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS admins (id BIGSERIAL PRIMARY KEY, \
             username TEXT NOT NULL UNIQUE, \
             is_active BOOLEAN NOT NULL DEFAULT TRUE, \
             created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP)"
        );
    }

    #[test]
    fn test_mysql_translation() {
        let ddl = translate_ddl(ADMINS, Engine::MySql);
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS admins (id BIGINT PRIMARY KEY AUTO_INCREMENT, \
             username VARCHAR(255) NOT NULL UNIQUE, \
             is_active TINYINT(1) NOT NULL DEFAULT 1, \
             created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP) \
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_integers_are_widened() {
        let ddl = translate_ddl(
            "CREATE TABLE ev (id INTEGER PRIMARY KEY, ts INTEGER NOT NULL, n INT)",
            Engine::Postgres,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS ev (id BIGSERIAL PRIMARY KEY, ts BIGINT NOT NULL, n BIGINT)"
        );

        let ddl = translate_ddl(
            "CREATE TABLE ev (id INTEGER PRIMARY KEY, ts INTEGER NOT NULL, n INT)",
            Engine::MySql,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS ev (id BIGINT PRIMARY KEY AUTO_INCREMENT, \
             ts BIGINT NOT NULL, n BIGINT) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_existing_if_not_exists_is_kept_once() {
        let ddl = translate_ddl("create table if not exists t (a real);", Engine::Postgres);
        assert_eq!(ddl, "CREATE TABLE IF NOT EXISTS t (a DOUBLE PRECISION)");
    }

    #[test]
    fn test_whole_word_matching() {
        let ddl = translate_ddl(
            "CREATE TABLE t (blob_id INTEGER, realm TEXT, payload BLOB, hint INTEGRAL)",
            Engine::Postgres,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS t (blob_id BIGINT, realm TEXT, payload BYTEA, hint INTEGRAL)"
        );
    }

    #[test]
    fn test_quoted_spans_untouched() {
        let ddl = translate_ddl(
            "CREATE TABLE \"blob\" (\"datetime\" DATETIME DEFAULT 'REAL')",
            Engine::Postgres,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"blob\" (\"datetime\" TIMESTAMP DEFAULT 'REAL')"
        );
    }

    #[test]
    fn test_mysql_identifier_quotes() {
        let ddl = translate_ddl(
            "CREATE TABLE \"order\" (\"key\" TEXT PRIMARY KEY, note TEXT DEFAULT 'a\"b')",
            Engine::MySql,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS `order` (`key` VARCHAR(255) PRIMARY KEY, \
             note TEXT DEFAULT 'a\"b') ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_mysql_inline_keys_in_any_order() {
        let ddl = translate_ddl(
            "CREATE TABLE s (code TEXT UNIQUE NOT NULL, name text not null primary key, note TEXT)",
            Engine::MySql,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS s (code VARCHAR(255) UNIQUE NOT NULL, \
             name VARCHAR(255) not null primary key, note TEXT) \
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_mysql_table_level_keys() {
        let ddl = translate_ddl(
            "CREATE TABLE m (a TEXT NOT NULL, \"b\" TEXT, c TEXT, d TEXT, \
             PRIMARY KEY (a, \"b\"), CONSTRAINT m_c UNIQUE (c))",
            Engine::MySql,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS m (a VARCHAR(255) NOT NULL, `b` VARCHAR(255), \
             c VARCHAR(255), d TEXT, PRIMARY KEY (a, `b`), CONSTRAINT m_c UNIQUE (c)) \
             ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_mysql_text_outside_keys_untouched() {
        let ddl = translate_ddl(
            "CREATE TABLE n (body TEXT CHECK (body <> 'UNIQUE'), ref TEXT REFERENCES s (code))",
            Engine::MySql,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS n (body TEXT CHECK (body <> 'UNIQUE'), \
             ref TEXT REFERENCES s (code)) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4"
        );
    }

    #[test]
    fn test_postgres_boolean_defaults_in_any_order() {
        let ddl = translate_ddl(
            "CREATE TABLE f (a BOOLEAN DEFAULT 1 NOT NULL, b boolean default 0, \
             c BOOLEAN NOT NULL UNIQUE DEFAULT 0, n INTEGER DEFAULT 1)",
            Engine::Postgres,
        );
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS f (a BOOLEAN DEFAULT TRUE NOT NULL, b boolean default FALSE, \
             c BOOLEAN NOT NULL UNIQUE DEFAULT FALSE, n BIGINT DEFAULT 1)"
        );
    }

    #[test]
    fn test_table_options_dropped() {
        let ddl = translate_ddl(
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB) WITHOUT ROWID",
            Engine::Postgres,
        );
        assert_eq!(ddl, "CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v BYTEA)");

        let ddl = translate_ddl("CREATE TABLE n (x INTEGER) STRICT, WITHOUT ROWID", Engine::Postgres);
        assert_eq!(ddl, "CREATE TABLE IF NOT EXISTS n (x BIGINT)");
    }

    #[test]
    fn test_defaults_with_other_values_untouched() {
        let ddl = translate_ddl("CREATE TABLE t (f BOOLEAN DEFAULT 10)", Engine::Postgres);
        assert_eq!(ddl, "CREATE TABLE IF NOT EXISTS t (f BOOLEAN DEFAULT 10)");
    }
}

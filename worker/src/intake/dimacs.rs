use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DimacsError {
    #[error("failed to read the instance file")]
    Io(#[from] std::io::Error),
    #[error("malformed literal '{0}'")]
    BadLiteral(String),
    #[error("clause left unterminated at end of file")]
    UnterminatedClause,
}

/// Parsed CNF instance: zero-terminated clause literals, ready for a
/// job description payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnfFormula {
    pub num_vars: usize,
    pub num_clauses: usize,
    pub literals: Vec<i32>,
}

/// Read a DIMACS CNF file. Comment lines and the problem line are
/// skipped; the literal stream is validated to end on a clause boundary.
pub fn parse_file(path: &Path) -> Result<CnfFormula, DimacsError> {
    let reader = BufReader::new(File::open(path)?);
    let mut literals = Vec::new();
    let mut num_vars = 0usize;
    let mut num_clauses = 0usize;

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('c') || line.starts_with('%') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('p') {
            // "p cnf <vars> <clauses>"
            let mut fields = rest.split_whitespace().skip(1);
            num_vars = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            continue;
        }
        for token in line.split_whitespace() {
            let lit: i32 = token
                .parse()
                .map_err(|_| DimacsError::BadLiteral(token.to_string()))?;
            if lit == 0 {
                num_clauses += 1;
            } else {
                num_vars = num_vars.max(lit.unsigned_abs() as usize);
            }
            literals.push(lit);
        }
    }

    if literals.last().is_some_and(|&l| l != 0) {
        return Err(DimacsError::UnterminatedClause);
    }
    Ok(CnfFormula {
        num_vars,
        num_clauses,
        literals,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_a_simple_instance() {
        let path = write_temp(
            "hivesat-dimacs-simple.cnf",
            "c a comment\np cnf 3 2\n1 -2 0\n2 3 0\n",
        );
        let cnf = parse_file(&path).unwrap();
        assert_eq!(cnf.num_vars, 3);
        assert_eq!(cnf.num_clauses, 2);
        assert_eq!(cnf.literals, vec![1, -2, 0, 2, 3, 0]);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_garbage_literals() {
        let path = write_temp("hivesat-dimacs-bad.cnf", "p cnf 1 1\n1 x 0\n");
        assert!(matches!(
            parse_file(&path),
            Err(DimacsError::BadLiteral(_))
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn rejects_unterminated_clause() {
        let path = write_temp("hivesat-dimacs-open.cnf", "p cnf 2 1\n1 2\n");
        assert!(matches!(
            parse_file(&path),
            Err(DimacsError::UnterminatedClause)
        ));
        std::fs::remove_file(path).ok();
    }
}

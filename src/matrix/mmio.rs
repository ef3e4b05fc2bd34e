use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};

use crate::matrix::csr::CsrMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symmetry {
    General,
    Symmetric,
    Hermitian,
    SkewSymmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataType {
    Pattern,
    Real,
    Integer,
    Complex,
}

struct Header {
    data_type: DataType,
    symmetry: Symmetry,
}

fn parse_header(line: &str) -> Result<Header> {
    let mut tokens = line.split_whitespace();
    let identifier = tokens.next().unwrap_or("");
    ensure!(identifier == "%%MatrixMarket", "invalid MatrixMarket header");
    let object = tokens.next().unwrap_or("");
    ensure!(
        object == "matrix",
        "invalid MatrixMarket object type [{object}]"
    );
    let format = tokens.next().unwrap_or("");
    ensure!(
        format == "coordinate",
        "invalid MatrixMarket storage format [{format}]"
    );
    let data_type = match tokens.next().unwrap_or("") {
        "pattern" => DataType::Pattern,
        "real" => DataType::Real,
        "integer" => DataType::Integer,
        "complex" => DataType::Complex,
        other => bail!("invalid MatrixMarket data type [{other}]"),
    };
    let symmetry = match tokens.next().unwrap_or("") {
        "general" => Symmetry::General,
        "symmetric" => Symmetry::Symmetric,
        "hermitian" => Symmetry::Hermitian,
        "skew-symmetric" => Symmetry::SkewSymmetric,
        other => bail!("invalid MatrixMarket symmetry type [{other}]"),
    };
    if data_type != DataType::Complex && symmetry == Symmetry::Hermitian {
        bail!("invalid MatrixMarket combination [{data_type:?}, hermitian]");
    }
    if data_type == DataType::Pattern && symmetry == Symmetry::SkewSymmetric {
        bail!("invalid MatrixMarket combination [pattern, skew-symmetric]");
    }
    if data_type == DataType::Complex {
        bail!("MatrixMarket data type [complex] not supported");
    }
    Ok(Header {
        data_type,
        symmetry,
    })
}

/// Read a coordinate-format Matrix Market file into CSR. Indices in the file
/// are 1-based; symmetric and skew-symmetric files emit the mirrored entry
/// (negated for skew).
pub fn read_matrix_market(path: &Path) -> Result<CsrMatrix> {
    let file = File::open(path)
        .with_context(|| format!("unable to open file \"{}\" for reading", path.display()))?;
    read_matrix_market_from(BufReader::new(file))
}

pub fn read_matrix_market_from(reader: impl BufRead) -> Result<CsrMatrix> {
    let mut lines = reader.lines();
    let header_line = lines
        .next()
        .ok_or_else(|| anyhow!("invalid MatrixMarket header"))??;
    let header = parse_header(&header_line)?;

    // skip comments up to the size line
    let size_line = loop {
        let line = lines
            .next()
            .ok_or_else(|| anyhow!("MatrixMarket file ends before size line"))??;
        if !line.starts_with('%') {
            break line;
        }
    };
    let mut tokens = size_line.split_whitespace();
    let num_rows: u32 = tokens
        .next()
        .ok_or_else(|| anyhow!("MatrixMarket invalid size line"))?
        .parse()?;
    let num_cols: u32 = tokens
        .next()
        .ok_or_else(|| anyhow!("MatrixMarket invalid size line"))?
        .parse()?;
    let nnz: usize = tokens
        .next()
        .ok_or_else(|| anyhow!("MatrixMarket invalid size line"))?
        .parse()?;

    let mut coo = Vec::with_capacity(nnz);
    for _ in 0..nnz {
        let line = lines
            .next()
            .ok_or_else(|| anyhow!("MatrixMarket file truncated"))??;
        let mut tokens = line.split_whitespace();
        let row_idx: u32 = tokens
            .next()
            .ok_or_else(|| anyhow!("MatrixMarket invalid data"))?
            .parse()
            .context("MatrixMarket invalid data")?;
        let col_idx: u32 = tokens
            .next()
            .ok_or_else(|| anyhow!("MatrixMarket invalid data"))?
            .parse()
            .context("MatrixMarket invalid data")?;
        ensure!(
            (1..=num_rows).contains(&row_idx) && (1..=num_cols).contains(&col_idx),
            "MatrixMarket invalid index"
        );
        let value = match header.data_type {
            DataType::Real | DataType::Integer => tokens
                .next()
                .ok_or_else(|| anyhow!("MatrixMarket invalid data"))?
                .parse()
                .context("MatrixMarket invalid data")?,
            _ => 1.0,
        };
        coo.push((row_idx - 1, col_idx - 1, value));
        if row_idx != col_idx {
            match header.symmetry {
                Symmetry::Symmetric | Symmetry::Hermitian => {
                    coo.push((col_idx - 1, row_idx - 1, value));
                }
                Symmetry::SkewSymmetric => {
                    coo.push((col_idx - 1, row_idx - 1, -value));
                }
                Symmetry::General => {}
            }
        }
    }
    Ok(CsrMatrix::from_coo(num_rows, num_cols, coo))
}

/// Write an edge list as a pattern Matrix Market file (1-based indices).
pub fn write_matrix_market_pattern(
    path: &Path,
    num_nodes: u32,
    edges: &[(u32, u32)],
    seed: u64,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("unable to open file \"{}\" for writing", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "%%MatrixMarket matrix coordinate pattern general")?;
    writeln!(out, "%seed: {}", seed)?;
    writeln!(out, "{} {} {}", num_nodes, num_nodes, edges.len())?;
    for &(src, dst) in edges {
        writeln!(out, "{} {}", src + 1, dst + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Result<CsrMatrix> {
        read_matrix_market_from(Cursor::new(text.to_string()))
    }

    #[test]
    fn reads_real_general() {
        let m = parse(
            "%%MatrixMarket matrix coordinate real general\n\
             % a comment\n\
             2 3 3\n\
             1 1 2.5\n\
             2 3 -1.0\n\
             1 2 4\n",
        )
        .unwrap();
        assert_eq!((m.num_rows, m.num_cols, m.nnz), (2, 3, 3));
        assert_eq!(m.row_ptr, vec![0, 2, 3]);
        assert_eq!(m.col_idx, vec![0, 1, 2]);
        assert_eq!(m.values, vec![2.5, 4.0, -1.0]);
    }

    #[test]
    fn pattern_entries_default_to_one() {
        let m = parse(
            "%%MatrixMarket matrix coordinate pattern general\n\
             2 2 2\n\
             1 1\n\
             2 2\n",
        )
        .unwrap();
        assert_eq!(m.values, vec![1.0, 1.0]);
    }

    #[test]
    fn symmetric_mirrors_off_diagonal() {
        let m = parse(
            "%%MatrixMarket matrix coordinate real symmetric\n\
             3 3 2\n\
             2 1 5.0\n\
             3 3 1.0\n",
        )
        .unwrap();
        assert_eq!(m.nnz, 3);
        assert_eq!(m.col_idx, vec![1, 0, 2]);
        assert_eq!(m.values, vec![5.0, 5.0, 1.0]);
    }

    #[test]
    fn skew_symmetric_negates_mirror() {
        let m = parse(
            "%%MatrixMarket matrix coordinate real skew-symmetric\n\
             2 2 1\n\
             2 1 3.0\n",
        )
        .unwrap();
        assert_eq!(m.values, vec![-3.0, 3.0]);
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(parse("%%MatrixMarket matrix coordinate complex general\n1 1 0\n").is_err());
        assert!(parse("%%MatrixMarket matrix array real general\n1 1 0\n").is_err());
        assert!(parse("%%MatrixMarket matrix coordinate pattern skew-symmetric\n1 1 0\n").is_err());
        assert!(parse("%%MatrixMarket matrix coordinate real hermitian\n1 1 0\n").is_err());
        assert!(parse("not a header\n").is_err());
    }

    #[test]
    fn rejects_out_of_range_indices() {
        assert!(parse(
            "%%MatrixMarket matrix coordinate real general\n\
             2 2 1\n\
             3 1 1.0\n"
        )
        .is_err());
        assert!(parse(
            "%%MatrixMarket matrix coordinate real general\n\
             2 2 1\n\
             0 1 1.0\n"
        )
        .is_err());
    }
}

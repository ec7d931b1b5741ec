//! Explicit parameter schemas and flat vectors.
//!
//! Every parameter record describes itself as an ordered list of named fields
//! with a semantic kind and shape. `flatten` writes the fields in order into
//! one unconstrained `Vec<f64>`; `unflatten` reads them back and rebuilds a
//! valid record. The encodings are chosen so that *every* flat vector decodes
//! to a valid record, which is what the gradient M-step relies on:
//!
//! | kind             | stored as                                   |
//! |------------------|---------------------------------------------|
//! | `Logits`         | log-probabilities, softmax per row on read  |
//! | `Vector`         | raw values                                  |
//! | `Matrix`         | raw values, row-major                       |
//! | `CholeskyFactor` | lower triangle of `L`, log on the diagonal  |
//! | `LogRates`       | `log λ`                                     |
//!
//! The log encodings cannot hold an exact zero. `FlatWriter` stores a zero
//! probability or rate as `ln(f64::MIN_POSITIVE)`, so it reads back as a
//! positive value below `1e-300` and the round trip is exact only away from
//! that boundary.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use ssm_common::{Error, Result};
use ssm_math::{gaussian, softmax};

/// Semantic kind of a parameter field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Logits,
    Vector,
    Matrix,
    CholeskyFactor,
    LogRates,
}

/// One named field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Logical shape. `CholeskyFactor` uses `[count, dim]`.
    pub shape: Vec<usize>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            kind,
            shape,
        }
    }

    /// Number of flat entries this field occupies.
    pub fn flat_len(&self) -> usize {
        match self.kind {
            FieldKind::CholeskyFactor => {
                let count = self.shape.first().copied().unwrap_or(0);
                let dim = self.shape.get(1).copied().unwrap_or(0);
                count * dim * (dim + 1) / 2
            }
            _ => self.shape.iter().product(),
        }
    }
}

/// Ordered, versioned field list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub version: u32,
    pub fields: Vec<FieldSpec>,
}

impl ParameterSchema {
    pub fn new(version: u32, fields: Vec<FieldSpec>) -> Self {
        Self { version, fields }
    }

    pub fn flat_len(&self) -> usize {
        self.fields.iter().map(FieldSpec::flat_len).sum()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Appends `other`'s fields, prefixing their names.
    pub fn extend_prefixed(&mut self, prefix: &str, other: ParameterSchema) {
        for mut f in other.fields {
            f.name = format!("{prefix}.{}", f.name);
            self.fields.push(f);
        }
    }
}

/// Flat parameter vector tagged with the schema version it was written with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatParams {
    pub schema_version: u32,
    pub values: Vec<f64>,
}

/// A parameter record with an explicit schema.
pub trait ParameterRecord: Sized {
    fn schema(&self) -> ParameterSchema;

    /// Fails only when a covariance field is not positive definite.
    fn write_fields(&self, writer: &mut FlatWriter) -> Result<()>;

    /// Rebuild a record with the same shapes as `self` from `reader`.
    fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self>;

    fn flatten(&self) -> Result<FlatParams> {
        let schema = self.schema();
        let mut writer = FlatWriter::with_capacity(schema.flat_len());
        self.write_fields(&mut writer)?;
        Ok(FlatParams {
            schema_version: schema.version,
            values: writer.finish(),
        })
    }

    /// Fails with [`Error::SchemaMismatch`] on a version or length mismatch.
    fn unflatten(&self, flat: &FlatParams) -> Result<Self> {
        let schema = self.schema();
        if flat.schema_version != schema.version {
            return Err(Error::SchemaMismatch(format!(
                "expected schema version {}, got {}",
                schema.version, flat.schema_version
            )));
        }
        if flat.values.len() != schema.flat_len() {
            return Err(Error::SchemaMismatch(format!(
                "expected {} values, got {}",
                schema.flat_len(),
                flat.values.len()
            )));
        }
        let mut reader = FlatReader::new(&flat.values);
        let record = self.read_fields(&mut reader)?;
        reader.finish()?;
        Ok(record)
    }
}

/// Sequential encoder for the field kinds.
#[derive(Debug, Default)]
pub struct FlatWriter {
    values: Vec<f64>,
}

impl FlatWriter {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            values: Vec::with_capacity(n),
        }
    }

    pub fn finish(self) -> Vec<f64> {
        self.values
    }

    pub fn vector(&mut self, v: &DVector<f64>) {
        self.values.extend(v.iter());
    }

    /// Row-major.
    pub fn matrix(&mut self, m: &DMatrix<f64>) {
        for i in 0..m.nrows() {
            self.values.extend(m.row(i).iter());
        }
    }

    /// Row-stochastic matrix as per-row log-probabilities. Zeros are
    /// clamped to `f64::MIN_POSITIVE` first.
    pub fn logits(&mut self, probs: &DMatrix<f64>) {
        for i in 0..probs.nrows() {
            self.values.extend(probs.row(i).iter().map(|p| p.max(f64::MIN_POSITIVE).ln()));
        }
    }

    /// Zero rates are clamped to `f64::MIN_POSITIVE` first.
    pub fn log_rates(&mut self, rates: &DMatrix<f64>) {
        for i in 0..rates.nrows() {
            self.values.extend(rates.row(i).iter().map(|r| r.max(f64::MIN_POSITIVE).ln()));
        }
    }

    /// Lower Cholesky factor of an SPD matrix; the diagonal is stored as log.
    pub fn cholesky(&mut self, cov: &DMatrix<f64>) -> Result<()> {
        let chol = gaussian::cholesky(cov).ok_or_else(|| Error::NotPositiveDefinite {
            what: "covariance being flattened".to_string(),
            step: None,
        })?;
        let l = chol.l();
        for i in 0..l.nrows() {
            for j in 0..=i {
                let v = l[(i, j)];
                self.values.push(if i == j { v.ln() } else { v });
            }
        }
        Ok(())
    }
}

/// Sequential decoder matching [`FlatWriter`].
#[derive(Debug)]
pub struct FlatReader<'a> {
    values: &'a [f64],
    pos: usize,
}

impl<'a> FlatReader<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [f64]> {
        let end = self.pos + n;
        if end > self.values.len() {
            return Err(Error::SchemaMismatch(format!(
                "flat vector ended at {} while reading {} values from {}",
                self.values.len(),
                n,
                self.pos
            )));
        }
        let out = &self.values[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Errors unless every value was consumed.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.values.len() {
            return Err(Error::SchemaMismatch(format!(
                "{} trailing values",
                self.values.len() - self.pos
            )));
        }
        Ok(())
    }

    pub fn vector(&mut self, len: usize) -> Result<DVector<f64>> {
        Ok(DVector::from_column_slice(self.take(len)?))
    }

    pub fn matrix(&mut self, rows: usize, cols: usize) -> Result<DMatrix<f64>> {
        Ok(DMatrix::from_row_slice(rows, cols, self.take(rows * cols)?))
    }

    pub fn logits(&mut self, rows: usize, cols: usize) -> Result<DMatrix<f64>> {
        let raw = self.take(rows * cols)?;
        let mut out = DMatrix::zeros(rows, cols);
        for i in 0..rows {
            let row = softmax(&raw[i * cols..(i + 1) * cols]);
            if row.iter().any(|p| !p.is_finite()) {
                return Err(Error::NonFiniteInput(format!("logits row {i}")));
            }
            for (j, p) in row.into_iter().enumerate() {
                out[(i, j)] = p;
            }
        }
        Ok(out)
    }

    pub fn log_rates(&mut self, rows: usize, cols: usize) -> Result<DMatrix<f64>> {
        let raw = self.take(rows * cols)?;
        Ok(DMatrix::from_row_slice(rows, cols, raw).map(f64::exp))
    }

    /// Rebuilds `L Lᵀ` from a stored factor.
    pub fn cholesky(&mut self, dim: usize) -> Result<DMatrix<f64>> {
        let raw = self.take(dim * (dim + 1) / 2)?;
        let mut l = DMatrix::zeros(dim, dim);
        let mut idx = 0;
        for i in 0..dim {
            for j in 0..=i {
                l[(i, j)] = if i == j { raw[idx].exp() } else { raw[idx] };
                idx += 1;
            }
        }
        Ok(gaussian::symmetrize(&(&l * l.transpose())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Toy {
        probs: DMatrix<f64>,
        cov: DMatrix<f64>,
    }

    impl ParameterRecord for Toy {
        fn schema(&self) -> ParameterSchema {
            ParameterSchema::new(
                1,
                vec![
                    FieldSpec::new("probs", FieldKind::Logits, vec![1, 3]),
                    FieldSpec::new("cov", FieldKind::CholeskyFactor, vec![1, 2]),
                ],
            )
        }

        fn write_fields(&self, writer: &mut FlatWriter) -> Result<()> {
            writer.logits(&self.probs);
            writer.cholesky(&self.cov)
        }

        fn read_fields(&self, reader: &mut FlatReader<'_>) -> Result<Self> {
            Ok(Self {
                probs: reader.logits(1, 3)?,
                cov: reader.cholesky(2)?,
            })
        }
    }

    fn toy() -> Toy {
        Toy {
            probs: DMatrix::from_row_slice(1, 3, &[0.2, 0.3, 0.5]),
            cov: DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]),
        }
    }

    #[test]
    fn test_flat_len() {
        let schema = toy().schema();
        assert_eq!(schema.flat_len(), 3 + 3);
        assert_eq!(schema.field("cov").unwrap().kind, FieldKind::CholeskyFactor);
    }

    #[test]
    fn test_recovers_record() {
        let t = toy();
        let back = t.unflatten(&t.flatten().unwrap()).unwrap();
        for (a, b) in back.probs.iter().zip(t.probs.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        for (a, b) in back.cov.iter().zip(t.cov.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn test_any_vector_decodes_to_valid_record() {
        let t = toy();
        let flat = FlatParams {
            schema_version: 1,
            values: vec![5.0, -3.0, 0.0, -2.0, 7.0, 1.5],
        };
        let rec = t.unflatten(&flat).unwrap();
        assert!((rec.probs.sum() - 1.0).abs() < 1e-12);
        assert!(gaussian::cholesky(&rec.cov).is_some());
    }

    #[test]
    fn test_zero_entries_come_back_tiny_but_positive() {
        let mut writer = FlatWriter::default();
        writer.logits(&DMatrix::from_row_slice(1, 2, &[1.0, 0.0]));
        writer.log_rates(&DMatrix::from_element(1, 1, 0.0));
        let values = writer.finish();
        assert!(values.iter().all(|v| v.is_finite()));

        let mut reader = FlatReader::new(&values);
        let probs = reader.logits(1, 2).unwrap();
        let rates = reader.log_rates(1, 1).unwrap();
        reader.finish().unwrap();
        assert_eq!(probs[(0, 0)], 1.0);
        assert!(probs[(0, 1)] > 0.0 && probs[(0, 1)] < 1e-300);
        assert!(rates[(0, 0)] > 0.0 && rates[(0, 0)] < 1e-300);
    }

    #[test]
    fn test_version_mismatch() {
        let t = toy();
        let mut flat = t.flatten().unwrap();
        flat.schema_version = 2;
        let err = t.unflatten(&flat).unwrap_err();
        assert_eq!(err.code(), 12);
    }

    #[test]
    fn test_length_mismatch() {
        let t = toy();
        let mut flat = t.flatten().unwrap();
        flat.values.pop();
        assert!(matches!(t.unflatten(&flat), Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_prefixed_schema() {
        let mut schema = ParameterSchema::new(1, vec![]);
        schema.extend_prefixed("emissions", toy().schema());
        assert_eq!(schema.fields[0].name, "emissions.probs");
    }
}

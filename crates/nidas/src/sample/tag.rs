// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample schemas: variables, tags, converters.
//!
//! A [`SampleTag`] is the addressable schema of one sample stream: a stable
//! id, a rate, and an ordered list of [`Variable`]s. The payload layout of a
//! scan is the concatenation of each variable's `length` values in
//! declaration order.

use super::SampleId;
use crate::error::{Error, Result};

/// Physical class of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Continuous,
    Counter,
    Clock,
    Other,
    /// Synthetic weight column (e.g. the resampler's nonNANs counter).
    Weight,
}

impl VarType {
    /// One-letter code used in sync-record headers.
    pub fn code(self) -> char {
        match self {
            VarType::Continuous => 'n',
            VarType::Counter => 'c',
            VarType::Clock => 't',
            VarType::Other => 'o',
            VarType::Weight => 'w',
        }
    }

    pub fn from_code(c: char) -> Option<VarType> {
        match c {
            'n' => Some(VarType::Continuous),
            'c' => Some(VarType::Counter),
            't' => Some(VarType::Clock),
            'o' => Some(VarType::Other),
            'w' => Some(VarType::Weight),
            _ => None,
        }
    }
}

/// Raw-to-engineering conversion. Pure function of `(timetag, raw)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Converter {
    Identity,
    Linear {
        intercept: f64,
        slope: f64,
        units: String,
    },
    Polynomial {
        /// c0 + c1*x + c2*x^2 + ...
        coefs: Vec<f64>,
        units: String,
    },
    /// Piecewise-linear lookup over (raw, engineering) points, raw ascending.
    Table {
        points: Vec<(f64, f64)>,
        units: String,
    },
}

impl Converter {
    pub fn linear(intercept: f64, slope: f64, units: impl Into<String>) -> Converter {
        Converter::Linear {
            intercept,
            slope,
            units: units.into(),
        }
    }

    pub fn polynomial(coefs: Vec<f64>, units: impl Into<String>) -> Converter {
        Converter::Polynomial {
            coefs,
            units: units.into(),
        }
    }

    pub fn convert(&self, _tt: i64, raw: f64) -> f64 {
        match self {
            Converter::Identity => raw,
            Converter::Linear {
                intercept, slope, ..
            } => intercept + slope * raw,
            Converter::Polynomial { coefs, .. } => {
                // Horner, highest order first
                coefs.iter().rev().fold(0.0, |acc, &c| acc * raw + c)
            }
            Converter::Table { points, .. } => {
                if points.is_empty() {
                    return f64::NAN;
                }
                if points.len() == 1 || raw <= points[0].0 {
                    return points[0].1;
                }
                if raw >= points[points.len() - 1].0 {
                    return points[points.len() - 1].1;
                }
                let hi = points.partition_point(|p| p.0 < raw);
                let (x0, y0) = points[hi - 1];
                let (x1, y1) = points[hi];
                if x1 == x0 {
                    y0
                } else {
                    y0 + (raw - x0) * (y1 - y0) / (x1 - x0)
                }
            }
        }
    }

    /// Converted (engineering) units, if the converter changes units.
    pub fn units(&self) -> Option<&str> {
        match self {
            Converter::Identity => None,
            Converter::Linear { units, .. }
            | Converter::Polynomial { units, .. }
            | Converter::Table { units, .. } => Some(units),
        }
    }
}

/// A named scalar or fixed-length vector quantity.
#[derive(Debug, Clone)]
pub struct Variable {
    name: String,
    units: String,
    long_name: String,
    var_type: VarType,
    length: usize,
    station: i32,
    converter: Converter,
    missing_value: Option<f64>,
    min_value: Option<f64>,
    max_value: Option<f64>,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Variable {
        Variable {
            name: name.into(),
            units: String::new(),
            long_name: String::new(),
            var_type: VarType::Continuous,
            length: 1,
            station: 0,
            converter: Converter::Identity,
            missing_value: None,
            min_value: None,
            max_value: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &str {
        &self.units
    }

    pub fn long_name(&self) -> &str {
        &self.long_name
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn station(&self) -> i32 {
        self.station
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Variable {
        self.units = units.into();
        self
    }

    pub fn with_long_name(mut self, long_name: impl Into<String>) -> Variable {
        self.long_name = long_name.into();
        self
    }

    pub fn with_type(mut self, t: VarType) -> Variable {
        self.var_type = t;
        self
    }

    pub fn with_length(mut self, length: usize) -> Variable {
        self.length = length.max(1);
        self
    }

    pub fn with_station(mut self, station: i32) -> Variable {
        self.station = station;
        self
    }

    pub fn with_converter(mut self, c: Converter) -> Variable {
        self.converter = c;
        self
    }

    pub fn with_missing_value(mut self, v: f64) -> Variable {
        self.missing_value = Some(v);
        self
    }

    pub fn with_limits(mut self, min: f64, max: f64) -> Variable {
        self.min_value = Some(min);
        self.max_value = Some(max);
        self
    }

    /// Apply screening and conversion to one raw value.
    ///
    /// A raw value equal to the declared missing value, or outside
    /// `[min, max]`, becomes NaN; otherwise the converter output.
    pub fn convert(&self, tt: i64, raw: f64) -> f64 {
        if let Some(miss) = self.missing_value {
            if raw == miss {
                return f64::NAN;
            }
        }
        if let Some(min) = self.min_value {
            if raw < min {
                return f64::NAN;
            }
        }
        if let Some(max) = self.max_value {
            if raw > max {
                return f64::NAN;
            }
        }
        self.converter.convert(tt, raw)
    }

    /// Name with embedded spaces replaced by underscores, as required by
    /// sync-record headers.
    pub fn header_name(&self) -> String {
        self.name.replace(' ', "_")
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.station == other.station
    }
}

/// Schema of one sample stream.
#[derive(Debug, Clone)]
pub struct SampleTag {
    id: SampleId,
    rate: f64,
    processed: bool,
    station: i32,
    variables: Vec<Variable>,
    /// Set once the tag is wired to a source; the layout is immutable after.
    frozen: bool,
}

impl SampleTag {
    pub fn new(id: SampleId, rate: f64) -> SampleTag {
        SampleTag {
            id,
            rate,
            processed: true,
            station: 0,
            variables: Vec::new(),
            frozen: false,
        }
    }

    pub fn id(&self) -> SampleId {
        self.id
    }

    /// Rate in Hz; zero means aperiodic.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn set_processed(&mut self, processed: bool) {
        self.processed = processed;
    }

    pub fn station(&self) -> i32 {
        self.station
    }

    pub fn set_station(&mut self, station: i32) {
        self.station = station;
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Append a variable to the scan layout.
    ///
    /// Fails with `InvalidState` once the tag is wired to a source.
    pub fn add_variable(&mut self, v: Variable) -> Result<()> {
        if self.frozen {
            return Err(Error::InvalidState(format!(
                "tag {:#x} already wired to a source, cannot add variable {}",
                self.id,
                v.name()
            )));
        }
        self.variables.push(v);
        Ok(())
    }

    /// Called by a source when the tag is wired; freezes the layout.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Data index of variable `k`: sum of the lengths of variables 0..k.
    pub fn data_index(&self, k: usize) -> usize {
        self.variables[..k].iter().map(Variable::length).sum()
    }

    /// Data index of a variable found by name/station equality.
    pub fn data_index_of(&self, v: &Variable) -> Option<usize> {
        self.variables
            .iter()
            .position(|x| x == v)
            .map(|k| self.data_index(k))
    }

    /// Total values in one scan.
    pub fn scan_length(&self) -> usize {
        self.variables.iter().map(Variable::length).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::make_id;

    #[test]
    fn test_linear_and_polynomial_convert() {
        let c = Converter::linear(1.0, 2.0, "m/s");
        assert_eq!(c.convert(0, 3.0), 7.0);

        let p = Converter::polynomial(vec![1.0, 0.0, 2.0], "degC");
        assert_eq!(p.convert(0, 3.0), 19.0);
    }

    #[test]
    fn test_table_convert_interpolates_and_clamps() {
        let t = Converter::Table {
            points: vec![(0.0, 0.0), (10.0, 100.0)],
            units: "hPa".into(),
        };
        assert_eq!(t.convert(0, 5.0), 50.0);
        assert_eq!(t.convert(0, -1.0), 0.0);
        assert_eq!(t.convert(0, 20.0), 100.0);
    }

    #[test]
    fn test_variable_screening() {
        let v = Variable::new("T")
            .with_missing_value(-999.0)
            .with_limits(-40.0, 60.0)
            .with_converter(Converter::linear(0.0, 1.0, "degC"));
        assert!(v.convert(0, -999.0).is_nan());
        assert!(v.convert(0, 75.0).is_nan());
        assert!(v.convert(0, -55.0).is_nan());
        assert_eq!(v.convert(0, 21.5), 21.5);
    }

    #[test]
    fn test_tag_data_index() {
        let mut tag = SampleTag::new(make_id(1, 0x10), 10.0);
        tag.add_variable(Variable::new("U")).unwrap();
        tag.add_variable(Variable::new("wind dir").with_length(3)).unwrap();
        tag.add_variable(Variable::new("W")).unwrap();

        assert_eq!(tag.data_index(0), 0);
        assert_eq!(tag.data_index(1), 1);
        assert_eq!(tag.data_index(2), 4);
        assert_eq!(tag.scan_length(), 5);

        let w = Variable::new("W");
        assert_eq!(tag.data_index_of(&w), Some(4));
        assert_eq!(tag.variables()[1].header_name(), "wind_dir");
    }

    #[test]
    fn test_add_variable_after_freeze_fails() {
        let mut tag = SampleTag::new(make_id(1, 0x10), 1.0);
        tag.add_variable(Variable::new("P")).unwrap();
        tag.freeze();
        let err = tag.add_variable(Variable::new("Q")).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Adaptive outlier detection per variable.
//!
//! An AR(1) model of the signal maintains running mean, variance and lag-1
//! correlation over a window. Each new value is compared to the one-step
//! forecast; a deviation beyond an adaptive discrimination level (the
//! inverse-erfc of a configured outlier probability, scaled by a user
//! multiplier and modulated by |correlation|) is replaced by the forecast
//! and flagged. The correlation-to-level adjustment curve is a natural cubic
//! spline through Hojstrup's table from simulated time series.

use crate::time::DsmTime;
use std::sync::OnceLock;

/// Warm-up window: statistics are only collected for this many points before
/// forecasting begins.
pub const STATISTICS_SIZE: usize = 500;

const ADJUST_TABLE_SIZE: usize = 100;
const LEN_ERFC_ARRAY: usize = 100;

/// Complementary error function, Chebyshev-fitted rational approximation.
/// Fractional error everywhere below 1.2e-7, which is far tighter than the
/// table interpolation layered on top of it.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let ans = t * (-z * z - 1.26551223
        + t * (1.00002368
            + t * (0.37409196
                + t * (0.09678418
                    + t * (-0.18628806
                        + t * (0.27886807
                            + t * (-1.13520398
                                + t * (1.48851587
                                    + t * (-0.82215223 + t * 0.17087277)))))))))
        .exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// Natural cubic spline second derivatives for tabulated `(x, y)`.
fn spline(x: &[f64], y: &[f64], yp1: f64, ypn: f64) -> Vec<f64> {
    let n = x.len();
    let mut y2 = vec![0.0; n];
    let mut u = vec![0.0; n - 1];

    if yp1 > 0.99e30 {
        y2[0] = 0.0;
        u[0] = 0.0;
    } else {
        y2[0] = -0.5;
        u[0] = (3.0 / (x[1] - x[0])) * ((y[1] - y[0]) / (x[1] - x[0]) - yp1);
    }

    for i in 1..n - 1 {
        let sig = (x[i] - x[i - 1]) / (x[i + 1] - x[i - 1]);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        u[i] = (y[i + 1] - y[i]) / (x[i + 1] - x[i]) - (y[i] - y[i - 1]) / (x[i] - x[i - 1]);
        u[i] = (6.0 * u[i] / (x[i + 1] - x[i - 1]) - sig * u[i - 1]) / p;
    }

    let (qn, un) = if ypn > 0.99e30 {
        (0.0, 0.0)
    } else {
        (
            0.5,
            (3.0 / (x[n - 1] - x[n - 2])) * (ypn - (y[n - 1] - y[n - 2]) / (x[n - 1] - x[n - 2])),
        )
    };
    y2[n - 1] = (un - qn * u[n - 2]) / (qn * y2[n - 2] + 1.0);

    for k in (0..n - 1).rev() {
        y2[k] = y2[k] * y2[k + 1] + u[k];
    }
    y2
}

/// Evaluate the spline from [`spline`] at `x`.
fn splint(xa: &[f64], ya: &[f64], y2a: &[f64], x: f64) -> f64 {
    let n = xa.len();
    let mut klo = 0;
    let mut khi = n - 1;
    while khi - klo > 1 {
        let k = (khi + klo) >> 1;
        if xa[k] > x {
            khi = k;
        } else {
            klo = k;
        }
    }
    let h = xa[khi] - xa[klo];
    let a = (xa[khi] - x) / h;
    let b = (x - xa[klo]) / h;
    a * ya[klo]
        + b * ya[khi]
        + ((a * a * a - a) * y2a[klo] + (b * b * b - b) * y2a[khi]) * (h * h) / 6.0
}

/// Discrimination-level adjustment vs |correlation|, built once.
fn adjust_table() -> &'static [[f64; 2]; ADJUST_TABLE_SIZE] {
    static TABLE: OnceLock<[[f64; 2]; ADJUST_TABLE_SIZE]> = OnceLock::new();
    TABLE.get_or_init(|| {
        // Hojstrup's table from simulated time series
        let x = [0.0, 0.1, 0.5, 0.9, 0.99];
        let y = [1.0, 1.0, 0.89, 0.44, 0.18];
        let ypn = -y[3] / (1.0 - x[3]);
        let y2 = spline(&x, &y, 1e30, ypn);

        let mut table = [[0.0; 2]; ADJUST_TABLE_SIZE];
        let mut a = 0.0;
        for row in table.iter_mut() {
            row[0] = a;
            row[1] = splint(&x, &y, &y2, a);
            a += 1.0 / ADJUST_TABLE_SIZE as f64;
        }
        table
    })
}

fn adjust_level(corr: f64) -> f64 {
    let adj = adjust_table();
    let incr = adj[1][0] - adj[0][0];
    let idx = (((corr - adj[0][0]) / incr).trunc() as isize)
        .clamp(0, ADJUST_TABLE_SIZE as isize - 2) as usize;
    adj[idx][1] + (corr - adj[idx][0]) * (adj[idx + 1][1] - adj[idx][1]) / incr
}

/// Gaussian discrimination level for an exceedance probability, by table
/// inversion of erfc.
fn discr_level(prob: f64) -> f64 {
    let mut ea = [[0.0f64; 2]; LEN_ERFC_ARRAY];
    let mut a = 0.0;
    for row in ea.iter_mut() {
        row[0] = a;
        row[1] = erfc(a / std::f64::consts::SQRT_2);
        a += 0.05;
    }
    // erfc is monotonically decreasing
    let mut i1 = 0;
    let mut i2 = LEN_ERFC_ARRAY - 1;
    while i2 > i1 + 1 {
        let i = (i1 + i2) / 2;
        if prob < ea[i][1] {
            i1 = i;
        } else {
            i2 = i;
        }
    }
    ea[i1][0] + (ea[i2][0] - ea[i1][0]) / (ea[i2][1] - ea[i1][1]) * (prob - ea[i1][1])
}

/// Per-variable adaptive despiker.
pub struct AdaptiveDespiker {
    prob: f64,
    level_multiplier: f64,
    max_missing_freq: f64,
    /// Previous accepted value.
    u1: f64,
    mean1: f64,
    mean2: f64,
    var1: f64,
    var2: f64,
    corr: f64,
    init_level: f64,
    level: f64,
    missfreq: f64,
    /// Adaptive memory size of the running statistics.
    msize: usize,
    npts: usize,
    /// Data gap beyond which the model resets.
    gap_usecs: DsmTime,
    last_time_tag: DsmTime,
}

impl AdaptiveDespiker {
    /// `out_prob` is the probability a good point exceeds the discrimination
    /// level under a normal model; `level_mult` scales the level.
    pub fn new(out_prob: f64, level_mult: f64) -> AdaptiveDespiker {
        let init_level = discr_level(out_prob) * level_mult;
        AdaptiveDespiker {
            prob: out_prob,
            level_multiplier: level_mult,
            max_missing_freq: 2.0,
            u1: 0.0,
            mean1: 0.0,
            mean2: 0.0,
            var1: 0.0,
            var2: 0.0,
            corr: 0.0,
            init_level,
            level: init_level,
            missfreq: 0.0,
            msize: 0,
            npts: 0,
            gap_usecs: 60 * 1_000_000,
            last_time_tag: 0,
        }
    }

    pub fn set_gap_secs(&mut self, secs: f64) {
        self.gap_usecs = (secs * 1e6) as DsmTime;
    }

    pub fn outlier_probability(&self) -> f64 {
        self.prob
    }

    pub fn level_multiplier(&self) -> f64 {
        self.level_multiplier
    }

    /// Forget the statistics; forecasting restarts after a fresh warm-up.
    pub fn reset(&mut self) {
        self.npts = 0;
        self.level = self.init_level;
        self.missfreq = 0.0;
    }

    fn forecast(&self) -> f64 {
        self.mean2 + self.corr * (self.u1 - self.mean1)
    }

    /// Screen one value. Returns the (possibly replaced) value and whether
    /// it was flagged as a spike.
    pub fn despike(&mut self, tt: DsmTime, u: f32) -> (f32, bool) {
        if self.last_time_tag != 0 && tt - self.last_time_tag > self.gap_usecs {
            self.reset();
        }
        self.last_time_tag = tt;

        let u = f64::from(u);

        if self.npts <= STATISTICS_SIZE {
            if self.npts == 0 {
                self.init_statistics(u);
            } else {
                self.increment_statistics(u);
            }
            return (u as f32, false);
        }

        // With most of the recent points missing, neither substitute
        // forecasts nor update the statistics.
        if self.missfreq > self.max_missing_freq {
            return (u as f32, false);
        }

        let uf = self.forecast();
        if u.is_nan() || (u - uf).abs() / self.var2.sqrt() > self.level {
            (uf as f32, true)
        } else {
            self.update_statistics(u);
            (u as f32, false)
        }
    }

    fn init_statistics(&mut self, u: f64) {
        if u.is_nan() {
            self.missfreq = 0.1;
            return;
        }
        self.missfreq = 0.0;
        // first point is repeated to seed mean1, var1 and corr
        self.mean2 = u;
        self.mean1 = u;
        self.var2 = u * u;
        self.var1 = u * u;
        self.corr = u * u;
        self.u1 = u;
        self.npts += 1;
    }

    fn increment_statistics(&mut self, u: f64) {
        if u.is_nan() {
            self.missfreq = self.missfreq * 0.9 + 0.1;
            return;
        }
        self.missfreq *= 0.9;

        // sums until the window closes
        self.corr += u * self.u1;
        self.mean2 += u;
        self.mean1 += self.u1;
        self.var2 += u * u;
        self.var1 += self.u1 * self.u1;
        self.u1 = u;

        self.npts += 1;
        if self.npts == STATISTICS_SIZE + 1 {
            let n = self.npts as f64;
            self.mean2 /= n;
            self.mean1 /= n;
            self.var2 = (self.var2 / n - self.mean2 * self.mean2).max(0.0);
            self.var1 = (self.var1 / n - self.mean1 * self.mean1).max(0.0);

            self.corr = (self.corr / n - self.mean2 * self.mean1)
                / (self.var1 * self.var2).sqrt();
            self.clamp_corr();

            self.msize = STATISTICS_SIZE;
            self.level = self.init_level * adjust_level(self.corr.abs());
        }
    }

    fn clamp_corr(&mut self) {
        self.corr = self.corr.clamp(-0.99, 0.99);
        if self.corr.abs() < 1e-10 && self.corr != 0.0 {
            self.corr *= 1e-10 / self.corr.abs();
        }
        if self.corr.is_nan() {
            self.corr = 1.0;
        }
    }

    fn update_statistics(&mut self, u: f64) {
        if u.is_nan() {
            self.missfreq = self.missfreq * 0.9 + 0.1;
            return;
        }
        self.missfreq *= 0.9;

        // back from correlation to un-normalized covariance
        self.corr *= (self.var1 * self.var2).sqrt();

        let m = self.msize as f64;
        let mx = (m - 1.0) / m;
        self.mean1 = self.mean2;
        self.mean2 = self.mean2 * mx + u / m;
        self.corr = self.corr * mx + (u - self.mean2) * (self.u1 - self.mean1) / m;
        self.var1 = self.var2;
        self.var2 = (self.var2 * mx + (u - self.mean2) * (u - self.mean2) / m).max(0.0);
        let v1v2 = self.var1 * self.var2;
        self.corr = if v1v2 == 0.0 {
            1.0
        } else {
            self.corr / v1v2.sqrt()
        };

        // The running-mean approximation can push the correlation outside
        // [-1, 1]; keep it sane.
        self.clamp_corr();

        // adaptive memory size
        self.msize = if self.corr.abs() < 0.1 {
            100
        } else {
            ((-230.2585 / self.corr.abs().ln()).round() as usize).min(self.npts)
        };

        if self.npts % 25 == 0 {
            self.level = self.init_level * adjust_level(self.corr.abs());
        }

        self.npts += 1;
        self.u1 = u;
    }
}

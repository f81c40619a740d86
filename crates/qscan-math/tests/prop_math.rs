// ─────────────────────────────────────────────────────────────────────
// QScan Emittance Core — Property-Based Tests (proptest) for qscan-math
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based tests for qscan-math using proptest.
//!
//! Covers: SVD reconstruction and ordering, Moore-Penrose identities of the
//! pseudoinverse, 2x2 determinant multiplicativity.

use ndarray::Array2;
use proptest::prelude::*;
use qscan_math::linalg::{det_2x2, matmul_2x2, pinv_svd, svd_small};

fn matrix(m: usize, n: usize, values: &[f64]) -> Array2<f64> {
    Array2::from_shape_fn((m, n), |(i, j)| values[i * n + j])
}

// ── SVD Properties ───────────────────────────────────────────────────

proptest! {
    /// SVD reconstruction: U * diag(sigma) * Vt ≈ A.
    #[test]
    fn svd_reconstruction(
        m in 1usize..7,
        n in 1usize..5,
        values in prop::collection::vec(-5.0f64..5.0, 36),
    ) {
        let a = matrix(m, n, &values);
        let (u, sigma, vt) = svd_small(&a);
        let k = sigma.len();
        prop_assert_eq!(k, m.min(n));

        for i in 0..m {
            for j in 0..n {
                let mut recon = 0.0;
                for s in 0..k {
                    recon += u[[i, s]] * sigma[s] * vt[[s, j]];
                }
                let err = (recon - a[[i, j]]).abs();
                prop_assert!(err < 1e-10,
                    "SVD recon error at ({},{}): {} vs {}, err = {}",
                    i, j, recon, a[[i, j]], err);
            }
        }
    }

    /// Singular values are non-negative and sorted descending.
    #[test]
    fn svd_sigma_nonneg_sorted(
        m in 2usize..7,
        n in 2usize..5,
        values in prop::collection::vec(-3.0f64..3.0, 36),
    ) {
        let a = matrix(m, n, &values);
        let (_u, sigma, _vt) = svd_small(&a);

        for i in 0..sigma.len() {
            prop_assert!(sigma[i] >= 0.0,
                "Negative singular value: sigma[{}] = {}", i, sigma[i]);
        }
        for i in 1..sigma.len() {
            prop_assert!(sigma[i] <= sigma[i - 1],
                "Singular values not sorted: sigma[{}]={} < sigma[{}]={}",
                i - 1, sigma[i - 1], i, sigma[i]);
        }
    }
}

// ── Pseudoinverse Properties ─────────────────────────────────────────

proptest! {
    /// A * A⁺ * A = A, including rank-deficient inputs.
    #[test]
    fn pinv_moore_penrose(
        m in 1usize..7,
        values in prop::collection::vec(-2.0f64..2.0, 21),
        duplicate_rows in any::<bool>(),
    ) {
        let mut a = matrix(m, 3, &values);
        if duplicate_rows && m > 1 {
            let first = a.row(0).to_owned();
            for mut row in a.rows_mut() {
                row.assign(&first);
            }
        }
        let p = pinv_svd(&a, 1e-13);
        prop_assert_eq!(p.dim(), (3, m));

        let apa = a.dot(&p).dot(&a);
        for (x, y) in apa.iter().zip(a.iter()) {
            prop_assert!((x - y).abs() < 1e-8, "A A+ A = {} vs A = {}", x, y);
        }
        let pap = p.dot(&a).dot(&p);
        for (x, y) in pap.iter().zip(p.iter()) {
            prop_assert!((x - y).abs() < 1e-6 * (1.0 + y.abs()), "A+ A A+ = {} vs A+ = {}", x, y);
        }
    }
}

// ── 2x2 Transport Helpers ────────────────────────────────────────────

proptest! {
    /// det(A B) = det(A) det(B).
    #[test]
    fn det_multiplicative(values in prop::collection::vec(-3.0f64..3.0, 8)) {
        let a = [[values[0], values[1]], [values[2], values[3]]];
        let b = [[values[4], values[5]], [values[6], values[7]]];
        let lhs = det_2x2(&matmul_2x2(&a, &b));
        let rhs = det_2x2(&a) * det_2x2(&b);
        prop_assert!((lhs - rhs).abs() < 1e-10, "{} vs {}", lhs, rhs);
    }
}

//! Small dense solvers for the linearised multilateration systems.

pub type Mat3 = [[f64; 3]; 3];

pub fn det3(m: &Mat3) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Scale-free conditioning measure: `|det| / prod(row norms)`, in `[0, 1]`.
///
/// Zero means the rows are linearly dependent, one means they are orthogonal.
pub fn hadamard_ratio3(m: &Mat3) -> f64 {
    let norms: f64 = m
        .iter()
        .map(|row| (row[0] * row[0] + row[1] * row[1] + row[2] * row[2]).sqrt())
        .product();
    if norms <= f64::EPSILON {
        return 0.0;
    }
    det3(m).abs() / norms
}

/// Solve `m * x = b` by Cramer's rule. `None` when the system is degenerate.
pub fn solve3(m: &Mat3, b: &[f64; 3], degeneracy: f64) -> Option<[f64; 3]> {
    if hadamard_ratio3(m) < degeneracy {
        return None;
    }
    let det = det3(m);
    let mut out = [0.0; 3];
    for (col, slot) in out.iter_mut().enumerate() {
        let mut replaced = *m;
        for row in 0..3 {
            replaced[row][col] = b[row];
        }
        *slot = det3(&replaced) / det;
    }
    Some(out)
}

/// Solve the 2x2 system `m * x = b`. `None` when the system is degenerate.
pub fn solve2(m: &[[f64; 2]; 2], b: &[f64; 2], degeneracy: f64) -> Option<[f64; 2]> {
    let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
    let n0 = (m[0][0] * m[0][0] + m[0][1] * m[0][1]).sqrt();
    let n1 = (m[1][0] * m[1][0] + m[1][1] * m[1][1]).sqrt();
    if n0 * n1 <= f64::EPSILON || det.abs() / (n0 * n1) < degeneracy {
        return None;
    }
    Some([
        (b[0] * m[1][1] - b[1] * m[0][1]) / det,
        (m[0][0] * b[1] - m[1][0] * b[0]) / det,
    ])
}

/// Accumulate the normal equations `AᵀA x = Aᵀb` for rows of width 3.
pub fn normal_equations3(rows: &[([f64; 3], f64)]) -> (Mat3, [f64; 3]) {
    let mut ata = [[0.0; 3]; 3];
    let mut atb = [0.0; 3];
    for (a, b) in rows {
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += a[i] * a[j];
            }
            atb[i] += a[i] * b;
        }
    }
    (ata, atb)
}

/// Accumulate the normal equations `AᵀA x = Aᵀb` for rows of width 2.
pub fn normal_equations2(rows: &[([f64; 2], f64)]) -> ([[f64; 2]; 2], [f64; 2]) {
    let mut ata = [[0.0; 2]; 2];
    let mut atb = [0.0; 2];
    for (a, b) in rows {
        for i in 0..2 {
            for j in 0..2 {
                ata[i][j] += a[i] * a[j];
            }
            atb[i] += a[i] * b;
        }
    }
    (ata, atb)
}

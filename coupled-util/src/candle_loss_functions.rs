use candle_core::{Result, Tensor};

/// Binary cross-entropy over probability scores
///
/// -mean( y * log(p) + (1 - y) * log(1 - p) )
///
/// * `p_n` - predicted probabilities in (0, 1)
/// * `y_n` - binary labels in {0, 1}
///
pub fn binary_cross_entropy(p_n: &Tensor, y_n: &Tensor) -> Result<Tensor> {
    let eps = 1e-7;
    let p_n = p_n.clamp(eps, 1.0 - eps)?;

    let pos = y_n.mul(&p_n.log()?)?;
    let neg = y_n
        .affine(-1.0, 1.0)?
        .mul(&p_n.affine(-1.0, 1.0)?.log()?)?;

    pos.add(&neg)?.neg()?.mean_all()
}

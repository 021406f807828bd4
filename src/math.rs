use itertools::izip;

/// `y += a * x`
pub(crate) fn axpy(arch: pulp::Arch, x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    arch.dispatch(|| {
        izip!(x, y).for_each(|(x, y)| {
            *y = a.mul_add(*x, *y);
        });
    });
}

//! Math types for raylink

pub use glam::{Affine3A, Mat3A, Vec3, Vec3A};

/// Serializes an affine transform into the kernel's column-major 3×4 layout:
/// the three basis columns followed by the translation.
pub fn to_column_major(transform: &Affine3A) -> [f32; 12] {
    let m = transform.matrix3;
    let t = transform.translation;
    [
        m.x_axis.x, m.x_axis.y, m.x_axis.z, //
        m.y_axis.x, m.y_axis.y, m.y_axis.z, //
        m.z_axis.x, m.z_axis.y, m.z_axis.z, //
        t.x, t.y, t.z,
    ]
}

pub fn from_column_major(xfm: &[f32; 12]) -> Affine3A {
    Affine3A::from_cols(
        Vec3A::new(xfm[0], xfm[1], xfm[2]),
        Vec3A::new(xfm[3], xfm[4], xfm[5]),
        Vec3A::new(xfm[6], xfm[7], xfm[8]),
        Vec3A::new(xfm[9], xfm[10], xfm[11]),
    )
}

/// Row-major 3×4: each row is `[m0, m1, m2, t]`.
pub fn from_row_major(xfm: &[f32; 12]) -> Affine3A {
    Affine3A::from_cols(
        Vec3A::new(xfm[0], xfm[4], xfm[8]),
        Vec3A::new(xfm[1], xfm[5], xfm[9]),
        Vec3A::new(xfm[2], xfm[6], xfm[10]),
        Vec3A::new(xfm[3], xfm[7], xfm[11]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    #[test]
    fn test_column_major_layout() {
        let transform = Affine3A::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let xfm = to_column_major(&transform);
        assert_eq!(
            xfm,
            [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 2.0, 3.0]
        );
    }

    #[test]
    fn test_column_major_roundtrip() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::new(2.0, 1.0, 0.5),
            Quat::from_rotation_y(0.7),
            Vec3::new(-4.0, 0.25, 9.0),
        );
        let back = from_column_major(&to_column_major(&transform));
        assert!(back.abs_diff_eq(transform, 1e-6));
    }

    #[test]
    fn test_row_major_is_transposed() {
        let transform = Affine3A::from_scale_rotation_translation(
            Vec3::ONE,
            Quat::from_rotation_z(1.1),
            Vec3::new(5.0, 6.0, 7.0),
        );
        let c = to_column_major(&transform);
        let row_major = [
            c[0], c[3], c[6], c[9], //
            c[1], c[4], c[7], c[10], //
            c[2], c[5], c[8], c[11],
        ];
        assert!(from_row_major(&row_major).abs_diff_eq(transform, 1e-6));
    }
}

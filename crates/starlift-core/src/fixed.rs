use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Used for positions and belt slot coordinates so that two scans of the
/// same platform serialize to identical bytes.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of simulation time.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only at the world boundary.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display and distance checks.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// Floor a fixed-point coordinate to the integer tile that contains it.
#[inline]
pub fn tile_of(v: Fixed64) -> i32 {
    v.floor().to_num::<i32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed64_round_trips_quarter_steps() {
        for v in [0.0, 0.25, 0.5, 0.75, -3.5, 12.125] {
            assert_eq!(fixed64_to_f64(f64_to_fixed64(v)), v);
        }
    }

    #[test]
    fn tile_of_floors_negative_coordinates() {
        assert_eq!(tile_of(f64_to_fixed64(-0.5)), -1);
        assert_eq!(tile_of(f64_to_fixed64(0.5)), 0);
        assert_eq!(tile_of(f64_to_fixed64(3.99)), 3);
    }
}

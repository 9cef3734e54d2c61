use crate::types::{QualityFlagSet, Raster, Sample, UsableMask, VerdureError, VerdureResult};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// HLS Fmask bit positions (least-significant bit first)
pub mod fmask {
    pub const CIRRUS: u8 = 0;
    pub const CLOUD: u8 = 1;
    pub const ADJACENT_TO_CLOUD: u8 = 2;
    pub const CLOUD_SHADOW: u8 = 3;
    pub const SNOW_ICE: u8 = 4;
    pub const WATER: u8 = 5;
    /// Aerosol level occupies bits 6-7
    pub const AEROSOL_LOW: u8 = 6;
    pub const AEROSOL_HIGH: u8 = 7;
}

/// Quality masking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityMaskParams {
    /// Bit indices that disqualify a pixel when set
    pub mask_bits: Vec<u8>,
}

impl Default for QualityMaskParams {
    fn default() -> Self {
        Self {
            mask_bits: vec![
                fmask::CLOUD,
                fmask::ADJACENT_TO_CLOUD,
                fmask::CLOUD_SHADOW,
                fmask::WATER,
            ],
        }
    }
}

/// Unpack a flag byte into its bits, index 0 being the lowest-order bit
pub fn unpack_bits(byte: u8) -> [bool; 8] {
    let mut bits = [false; 8];
    for (i, bit) in bits.iter_mut().enumerate() {
        *bit = (byte >> i) & 1 == 1;
    }
    bits
}

/// Combine bit indices into a single mask byte. Order and repeats do not matter.
pub fn disqualifying_bitmask(bits: &[u8]) -> VerdureResult<u8> {
    bits.iter().try_fold(0u8, |mask, &bit| {
        if bit > 7 {
            return Err(VerdureError::InvalidFormat(format!(
                "Quality bit index {} is outside an 8-bit flag byte",
                bit
            )));
        }
        Ok(mask | (1u8 << bit))
    })
}

/// A pixel is usable when none of the masked bits are set and it is not nodata
#[inline]
pub fn is_usable(byte: u8, bitmask: u8, nodata: Option<u8>) -> bool {
    if nodata == Some(byte) {
        return false;
    }
    byte & bitmask == 0
}

/// Derive the usable-pixel mask from a quality raster
pub fn decode_usable_mask(flags: &QualityFlagSet, bits: &[u8]) -> VerdureResult<UsableMask> {
    let bitmask = disqualifying_bitmask(bits)?;
    log::debug!(
        "Decoding quality mask {}x{} with bitmask {:#010b}",
        flags.data.nrows(),
        flags.data.ncols(),
        bitmask
    );

    let data = flags.data.mapv(|byte| is_usable(byte, bitmask, flags.nodata));

    let mask = UsableMask {
        data,
        geo_transform: flags.geo_transform,
        crs: flags.crs.clone(),
    };

    log::debug!(
        "Usable pixels: {} of {}",
        mask.usable_count(),
        mask.data.len()
    );
    Ok(mask)
}

/// Set every pixel the mask rejects to missing
pub fn apply_usable_mask(raster: &Raster, mask: &UsableMask) -> VerdureResult<Raster> {
    raster.ensure_same_crs(&mask.crs)?;
    if raster.shape() != mask.data.dim() {
        return Err(VerdureError::ShapeMismatch {
            expected: mask.data.dim(),
            found: raster.shape(),
        });
    }

    let mut data = Array2::<Sample>::from_elem(raster.shape(), Sample::NAN);
    Zip::from(&mut data)
        .and(&raster.data)
        .and(&mask.data)
        .for_each(|out, &value, &usable| {
            if usable {
                *out = value;
            }
        });

    Ok(raster.with_data(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Crs, GeoTransform};
    use ndarray::array;

    fn flags(data: Array2<u8>, nodata: Option<u8>) -> QualityFlagSet {
        QualityFlagSet {
            data,
            nodata,
            geo_transform: GeoTransform::north_up(0.0, 0.0, 30.0, 30.0),
            crs: Crs::Epsg(32613),
        }
    }

    #[test]
    fn test_unpack_bits_lsb_first() {
        let bits = unpack_bits(0b0000_0110);
        assert_eq!(bits, [false, true, true, false, false, false, false, false]);
        assert!(unpack_bits(0b1000_0000)[7]);
    }

    #[test]
    fn test_disqualifying_bytes() {
        let bits = [1, 2, 3, 5];
        let mask = disqualifying_bitmask(&bits).unwrap();
        assert!(!is_usable(0b0000_0110, mask, None));
        assert!(is_usable(0b0001_0000, mask, None));
        assert!(is_usable(0b0100_0001, mask, None));
    }

    #[test]
    fn test_matches_unpacked_bit_sum_for_all_bytes() {
        let bits = [0, 3, 7];
        let mask = disqualifying_bitmask(&bits).unwrap();
        for byte in 0..=u8::MAX {
            let unpacked = unpack_bits(byte);
            let flagged: u32 = bits.iter().map(|&b| unpacked[b as usize] as u32).sum();
            assert_eq!(is_usable(byte, mask, None), flagged == 0, "byte {:#010b}", byte);
        }
    }

    #[test]
    fn test_bit_order_does_not_matter() {
        let a = disqualifying_bitmask(&[5, 1, 3, 2]).unwrap();
        let b = disqualifying_bitmask(&[1, 2, 3, 5, 5]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_bit_index_out_of_range() {
        assert!(disqualifying_bitmask(&[8]).is_err());
    }

    #[test]
    fn test_nodata_is_never_usable() {
        let q = flags(array![[255u8, 0], [0b0001_0000, 0b0000_0010]], Some(255));
        let mask = decode_usable_mask(&q, &[1, 2, 3, 5]).unwrap();
        assert_eq!(mask.data, array![[false, true], [true, false]]);
    }

    #[test]
    fn test_apply_mask_sets_missing_not_zero() {
        let q = flags(array![[0u8, 2]], None);
        let mask = decode_usable_mask(&q, &[1]).unwrap();
        let band = Raster::new(array![[0.12f32, 0.34]], q.geo_transform, q.crs.clone());
        let masked = apply_usable_mask(&band, &mask).unwrap();
        assert_eq!(masked.data[[0, 0]], 0.12);
        assert!(masked.data[[0, 1]].is_nan());
    }

    #[test]
    fn test_apply_mask_shape_mismatch() {
        let q = flags(array![[0u8, 0]], None);
        let mask = decode_usable_mask(&q, &[1]).unwrap();
        let band = Raster::new(array![[0.1f32], [0.2]], q.geo_transform, q.crs.clone());
        assert!(matches!(
            apply_usable_mask(&band, &mask),
            Err(VerdureError::ShapeMismatch { .. })
        ));
    }
}

use crate::config::VqganConfig;
use crate::model::quantizer::QuantizerKind;

/// 256x256 images on a 16x16 grid of 1024 codes.
pub fn f16_config(quantizer: QuantizerKind) -> VqganConfig {
    VqganConfig::new()
        .with_resolution(256)
        .with_hidden_dim(128)
        .with_ch_mult(vec![1, 1, 2, 2, 4])
        .with_num_res_blocks(2)
        .with_attn_resolutions(vec![16])
        .with_z_channels(256)
        .with_num_codes(1024)
        .with_codebook_dim(256)
        .with_quantizer(quantizer)
}

/// Same layout on a 32x32 grid of 8192 codes.
pub fn f8_config(quantizer: QuantizerKind) -> VqganConfig {
    f16_config(quantizer)
        .with_ch_mult(vec![1, 2, 2, 4])
        .with_attn_resolutions(vec![32])
        .with_num_codes(8192)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_sides_follow_the_level_count() {
        assert_eq!(f16_config(QuantizerKind::Hard).latent_resolution(), 16);
        assert_eq!(f8_config(QuantizerKind::Ema).latent_resolution(), 32);
    }
}

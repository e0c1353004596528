use crate::config::VqganConfig;
use crate::model::quantizer::QuantizerKind;

/// Small model on 32x32 images that trains on a CPU in seconds; used by the
/// driver binary's smoke runs.
pub fn tiny_config(quantizer: QuantizerKind) -> VqganConfig {
    VqganConfig::new()
        .with_resolution(32)
        .with_hidden_dim(16)
        .with_ch_mult(vec![1, 2, 2])
        .with_num_res_blocks(1)
        .with_attn_resolutions(vec![8])
        .with_z_channels(32)
        .with_num_codes(64)
        .with_codebook_dim(32)
        .with_disc_ndf(16)
        .with_disc_num_layers(2)
        .with_disc_start(20)
        .with_learning_rate(2e-4)
        .with_batch_size(4)
        .with_quantizer(quantizer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiny_preset_is_valid_for_every_quantizer() {
        for kind in [QuantizerKind::Hard, QuantizerKind::Ema, QuantizerKind::Gumbel] {
            let config = tiny_config(kind);

            config.validate().unwrap();
            assert_eq!(config.tokens_per_image(), 64);
        }
    }
}

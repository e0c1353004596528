use burn::config::Config;
use burn::module::{Module, Param};
use burn::nn::conv::Conv2d;
use burn::prelude::{Backend, Int, Tensor};
use burn::tensor::backend::AutodiffBackend;

use crate::error::{Result, VqError};
use crate::model::block::conv1x1;
use crate::model::decoder::{Decoder, DecoderConfig};
use crate::model::encoder::{Encoder, EncoderConfig};
use crate::model::init::{InitPolicy, LayerKindInit};
use crate::model::quantizer::{unflatten_grid, QuantizeInfo, Quantized, Quantizer, QuantizerConfig};
use crate::ops::{l2, ScalarExt};

pub mod block;
pub mod decoder;
pub mod encoder;
pub mod init;
pub mod quantizer;

#[derive(Config, Debug)]
pub struct AutoencoderConfig {
    #[config(default = "InitPolicy::NameMatch")]
    pub init_policy: InitPolicy,
}

impl AutoencoderConfig {
    pub fn init<B: Backend, EC: EncoderConfig, DC: DecoderConfig, QC: QuantizerConfig>(
        self,
        encoder_config: EC,
        decoder_config: DC,
        quantizer_config: QC,
        device: &B::Device,
    ) -> Autoencoder<B, EC::Model<B>, DC::Model<B>, QC::Model<B>> {
        let quant_conv = conv1x1(encoder_config.out_channels(), quantizer_config.input_dim(), device);
        let post_quant_conv = conv1x1(quantizer_config.codebook_dim(), decoder_config.in_channels(), device);

        let autoencoder = Autoencoder {
            encoder: <EC::Model<B> as Encoder<B>>::new(encoder_config, device),
            quant_conv,
            quantizer: <QC::Model<B> as Quantizer<B>>::new(quantizer_config, device),
            post_quant_conv,
            decoder: <DC::Model<B> as Decoder<B>>::new(decoder_config, device),
        };

        autoencoder.init_parameters(self.init_policy)
    }
}

#[derive(Module, Debug)]
pub struct Autoencoder<B: Backend, E, D, Q> {
    pub encoder: E,
    pub quant_conv: Conv2d<B>,
    pub quantizer: Q,
    pub post_quant_conv: Conv2d<B>,
    pub decoder: D,
}

pub enum DecodeInput<B: Backend> {
    /// Quantized latent grid (batch, codebook_dim, height, width).
    Grid(Tensor<B, 4>),
    /// Code indices (batch, tokens_per_image) laid out as a square grid.
    Tokens(Tensor<B, 2, Int>),
}

pub struct AutoencoderOutput<B: Backend> {
    pub reconstruction: Tensor<B, 4>,
    pub quant_loss: Tensor<B, 1>,
    pub info: QuantizeInfo<B>,
    pub last_layer: LastLayer<B>,
}

/// Norm of the gradient of a loss with respect to the decoder's output kernel.
pub trait LastLayerGradient<B: Backend> {
    fn grad_norm(&self, loss: &dyn Fn(Tensor<B, 4>) -> Tensor<B, 1>) -> f32;
}

/// Detached input of the decoder's output convolution together with that
/// convolution, so the reconstruction can be replayed on its own graph.
#[derive(Debug, Clone)]
pub struct LastLayer<B: Backend> {
    hidden: Tensor<B, 4>,
    head: Conv2d<B>,
}

impl<B: Backend> LastLayer<B> {
    pub fn new(hidden: Tensor<B, 4>, head: Conv2d<B>) -> Self {
        Self {
            hidden: hidden.detach(),
            head,
        }
    }
}

impl<B: AutodiffBackend> LastLayerGradient<B> for LastLayer<B> {
    fn grad_norm(&self, loss: &dyn Fn(Tensor<B, 4>) -> Tensor<B, 1>) -> f32 {
        let weight = self.head.weight.val().detach().require_grad();

        let mut head = self.head.clone().no_grad();
        head.weight = Param::initialized(head.weight.id.clone(), weight.clone());

        let reconstruction = head.forward(self.hidden.clone());
        let grads = loss(reconstruction).backward();

        weight
            .grad(&grads)
            .map(|grad| l2(grad).scalar::<f32>())
            .unwrap_or(0.0)
    }
}

impl<B, E, D, Q> Autoencoder<B, E, D, Q>
where
    B: Backend,
    E: Encoder<B>,
    D: Decoder<B>,
    Q: Quantizer<B>,
{
    fn init_parameters(mut self, policy: InitPolicy) -> Self {
        match policy {
            InitPolicy::NameMatch => {
                tracing::debug!("name-matched initialization selects no nested parameter");
            }
            InitPolicy::LayerKind => {
                let mut mapper = LayerKindInit;
                self.encoder = self.encoder.map(&mut mapper);
                self.quant_conv = self.quant_conv.map(&mut mapper);
                self.post_quant_conv = self.post_quant_conv.map(&mut mapper);
                self.decoder = self.decoder.map(&mut mapper);
            }
        }

        self
    }

    fn latent(&self, image: Tensor<B, 4>) -> Tensor<B, 4> {
        let hidden = self.encoder.forward(image);
        self.quant_conv.forward(hidden)
    }

    /// Encodes and quantizes an image. In training mode the quantizer's
    /// post-forward update (EMA statistics) is applied.
    pub fn encode(&mut self, image: Tensor<B, 4>, training: bool) -> Result<Quantized<B>> {
        let latent = self.latent(image);
        let quantized = self.quantizer.quantize(latent.clone(), training)?;

        if training {
            self.quantizer.update(latent, &quantized.info);
        }

        Ok(quantized)
    }

    /// Evaluation-mode encoding that leaves every quantizer state untouched.
    pub fn encode_eval(&self, image: Tensor<B, 4>) -> Result<Quantized<B>> {
        self.quantizer.quantize(self.latent(image), false)
    }

    pub fn decode(&self, input: DecodeInput<B>) -> Result<Tensor<B, 4>> {
        match input {
            DecodeInput::Grid(grid) => Ok(self.decode_grid(grid)),
            DecodeInput::Tokens(tokens) => self.decode_code(tokens),
        }
    }

    fn decode_grid(&self, grid: Tensor<B, 4>) -> Tensor<B, 4> {
        let latent = self.post_quant_conv.forward(grid);
        self.decoder.forward(latent)
    }

    /// Decodes (batch, n) code indices laid out on a square grid.
    pub fn decode_code(&self, tokens: Tensor<B, 2, Int>) -> Result<Tensor<B, 4>> {
        let [batch, len] = tokens.dims();
        if batch == 0 {
            return Err(VqError::EmptyBatch);
        }

        let side = (len as f64).sqrt().round() as usize;
        if len == 0 || side * side != len {
            return Err(VqError::NonSquareTokens(len));
        }

        let rows = self.quantizer.dequantize(tokens.reshape([batch * len]))?;
        let grid = unflatten_grid(rows, [batch, side, side]);

        Ok(self.decode_grid(grid))
    }

    /// Code indices (batch, tokens_per_image) of images with values in [0, 1].
    pub fn get_codebook_indices(&self, image: Tensor<B, 4>) -> Result<Tensor<B, 2, Int>> {
        let image = image.detach() * 2.0 - 1.0;
        let quantized = self.encode_eval(image)?;

        Ok(quantized.info.tokens())
    }

    /// Reconstruction and quantization loss.
    pub fn forward(&mut self, image: Tensor<B, 4>, training: bool) -> Result<(Tensor<B, 4>, Tensor<B, 1>)> {
        let output = self.forward_step(image, training)?;
        Ok((output.reconstruction, output.quant_loss))
    }

    pub fn forward_step(&mut self, image: Tensor<B, 4>, training: bool) -> Result<AutoencoderOutput<B>> {
        let quantized = self.encode(image, training)?;

        let latent = self.post_quant_conv.forward(quantized.quantized);
        let hidden = self.decoder.forward_hidden(latent);
        let head = self.decoder.last_layer();
        let reconstruction = head.forward(hidden.clone());

        Ok(AutoencoderOutput {
            reconstruction,
            quant_loss: quantized.loss,
            info: quantized.info,
            last_layer: LastLayer::new(hidden, head.clone()),
        })
    }

    pub fn last_layer_weight(&self) -> Tensor<B, 4> {
        self.decoder.last_layer().weight.val()
    }
}

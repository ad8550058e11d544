//! CNN Model Architecture for Chest X-ray Classification
//!
//! An [`ArchitectureSpec`] describes the network as an ordered list of layer
//! descriptors. It is validated once and then turned into a [`ConvClassifier`]
//! burn module. The standard topology is three `conv(3x3, relu) -> maxpool(2)`
//! stages with 32/64/128 filters, flatten, dropout 0.5, dense 512 relu and a
//! dense softmax output.

use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use xray_core::{Error, Result, DEFAULT_CHANNELS, DEFAULT_IMAGE_SIZE, DEFAULT_NUM_CLASSES};

/// Layer activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Softmax,
}

/// One layer descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// Valid-padded, unit-stride square convolution
    Conv2d {
        filters: usize,
        kernel_size: usize,
        activation: Activation,
    },
    /// Square max pooling with stride equal to the window
    MaxPool { window: usize },
    Flatten,
    Dropout { rate: f64 },
    Dense { units: usize, activation: Activation },
}

/// Image input shape (height x width x channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Default for InputShape {
    fn default() -> Self {
        Self {
            height: DEFAULT_IMAGE_SIZE,
            width: DEFAULT_IMAGE_SIZE,
            channels: DEFAULT_CHANNELS,
        }
    }
}

/// Declarative network description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureSpec {
    pub input: InputShape,
    pub num_classes: usize,
    pub layers: Vec<LayerSpec>,
}

impl Default for ArchitectureSpec {
    fn default() -> Self {
        Self::standard()
    }
}

/// Validated layout that [`ArchitectureSpec::init`] instantiates.
#[derive(Debug, Clone, PartialEq)]
struct Plan {
    /// (in_channels, filters, kernel, pool window)
    conv: Vec<(usize, usize, usize, usize)>,
    /// (dropout before, in_features, out_features)
    dense: Vec<(Option<f64>, usize, usize)>,
    feature_size: usize,
}

impl ArchitectureSpec {
    /// Standard topology for 224x224x3 inputs and three classes.
    pub fn standard() -> Self {
        Self::standard_for(InputShape::default(), DEFAULT_NUM_CLASSES)
    }

    /// Standard topology for an arbitrary input shape and class count.
    pub fn standard_for(input: InputShape, num_classes: usize) -> Self {
        let mut layers = Vec::new();
        for filters in [32, 64, 128] {
            layers.push(LayerSpec::Conv2d {
                filters,
                kernel_size: 3,
                activation: Activation::Relu,
            });
            layers.push(LayerSpec::MaxPool { window: 2 });
        }
        layers.extend([
            LayerSpec::Flatten,
            LayerSpec::Dropout { rate: 0.5 },
            LayerSpec::Dense {
                units: 512,
                activation: Activation::Relu,
            },
            LayerSpec::Dense {
                units: num_classes,
                activation: Activation::Softmax,
            },
        ]);
        Self {
            input,
            num_classes,
            layers,
        }
    }

    /// Check the layer list without allocating any parameters.
    pub fn validate(&self) -> Result<()> {
        self.plan().map(|_| ())
    }

    /// Length of the flattened feature vector fed to the first dense layer.
    pub fn feature_size(&self) -> Result<usize> {
        Ok(self.plan()?.feature_size)
    }

    /// Number of trainable parameters (weights and biases).
    pub fn parameter_count(&self) -> Result<usize> {
        let plan = self.plan()?;
        let conv: usize = plan
            .conv
            .iter()
            .map(|&(in_ch, filters, k, _)| k * k * in_ch * filters + filters)
            .sum();
        let dense: usize = plan
            .dense
            .iter()
            .map(|&(_, d_in, d_out)| d_in * d_out + d_out)
            .sum();
        Ok(conv + dense)
    }

    /// Build the burn module for this architecture.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<ConvClassifier<B>> {
        let plan = self.plan()?;

        let stages = plan
            .conv
            .iter()
            .map(|&(in_ch, filters, k, window)| ConvStage::new(in_ch, filters, k, window, device))
            .collect();

        let mut dense: Vec<DenseStage<B>> = plan
            .dense
            .iter()
            .map(|&(dropout, d_in, d_out)| DenseStage::new(dropout, d_in, d_out, device))
            .collect();
        let output = dense
            .pop()
            .ok_or_else(|| config_error("architecture has no output layer"))?;

        Ok(ConvClassifier {
            stages,
            hidden: dense,
            output,
            activation: Relu::new(),
            num_classes: self.num_classes,
        })
    }

    fn plan(&self) -> Result<Plan> {
        let InputShape {
            height,
            width,
            channels,
        } = self.input;
        if height == 0 || width == 0 || channels == 0 {
            return Err(config_error(format!(
                "input dimensions must be positive, got {}x{}x{}",
                height, width, channels
            )));
        }
        if self.num_classes == 0 {
            return Err(config_error("num_classes must be positive"));
        }

        let (mut h, mut w, mut c) = (height, width, channels);
        let mut conv = Vec::new();
        let mut dense = Vec::new();
        let mut flattened: Option<usize> = None;
        let mut pending_dropout: Option<f64> = None;
        let mut final_softmax = false;

        let mut layers = self.layers.iter().enumerate().peekable();
        while let Some((idx, layer)) = layers.next() {
            if final_softmax {
                return Err(config_error(format!(
                    "layer {} follows the softmax output layer",
                    idx
                )));
            }
            match *layer {
                LayerSpec::Conv2d {
                    filters,
                    kernel_size,
                    activation,
                } => {
                    if flattened.is_some() {
                        return Err(config_error(format!(
                            "convolution at layer {} appears after flatten",
                            idx
                        )));
                    }
                    if filters == 0 || kernel_size == 0 {
                        return Err(config_error(format!(
                            "convolution at layer {} needs positive filters and kernel",
                            idx
                        )));
                    }
                    if activation != Activation::Relu {
                        return Err(config_error(format!(
                            "convolution at layer {} must use relu",
                            idx
                        )));
                    }
                    if kernel_size > h || kernel_size > w {
                        return Err(config_error(format!(
                            "{}x{} kernel at layer {} exceeds the {}x{} feature map",
                            kernel_size, kernel_size, idx, h, w
                        )));
                    }
                    let window = match layers.next() {
                        Some((_, LayerSpec::MaxPool { window })) => *window,
                        _ => {
                            return Err(config_error(format!(
                                "convolution at layer {} must be followed by max pooling",
                                idx
                            )))
                        }
                    };
                    if window == 0 {
                        return Err(config_error(format!(
                            "pooling window after layer {} must be positive",
                            idx
                        )));
                    }
                    h = (h - kernel_size + 1) / window;
                    w = (w - kernel_size + 1) / window;
                    if h == 0 || w == 0 {
                        return Err(config_error(format!(
                            "feature map vanishes after the stage starting at layer {}; input {}x{} is too small",
                            idx, height, width
                        )));
                    }
                    conv.push((c, filters, kernel_size, window));
                    c = filters;
                }
                LayerSpec::MaxPool { .. } => {
                    return Err(config_error(format!(
                        "max pooling at layer {} must directly follow a convolution",
                        idx
                    )));
                }
                LayerSpec::Flatten => {
                    if flattened.is_some() {
                        return Err(config_error(format!("duplicate flatten at layer {}", idx)));
                    }
                    flattened = Some(h * w * c);
                }
                LayerSpec::Dropout { rate } => {
                    if flattened.is_none() {
                        return Err(config_error(format!(
                            "dropout at layer {} must come after flatten",
                            idx
                        )));
                    }
                    if !(0.0..1.0).contains(&rate) {
                        return Err(config_error(format!(
                            "dropout rate {} at layer {} is outside [0, 1)",
                            rate, idx
                        )));
                    }
                    if pending_dropout.replace(rate).is_some() {
                        return Err(config_error(format!("consecutive dropout at layer {}", idx)));
                    }
                }
                LayerSpec::Dense { units, activation } => {
                    let Some(feature_size) = flattened else {
                        return Err(config_error(format!(
                            "dense layer {} must come after flatten",
                            idx
                        )));
                    };
                    if units == 0 {
                        return Err(config_error(format!("dense layer {} has no units", idx)));
                    }
                    let d_in = dense.last().map_or(feature_size, |&(_, _, d_out)| d_out);
                    let is_last = layers.peek().is_none();
                    match (activation, is_last) {
                        (Activation::Relu, false) => {}
                        (Activation::Softmax, true) => {
                            if units != self.num_classes {
                                return Err(config_error(format!(
                                    "output layer has {} units but there are {} classes",
                                    units, self.num_classes
                                )));
                            }
                            final_softmax = true;
                        }
                        (Activation::Relu, true) => {
                            return Err(config_error("the last layer must be a softmax dense layer"))
                        }
                        (Activation::Softmax, false) => {
                            return Err(config_error(format!(
                                "softmax at layer {} is only allowed on the output layer",
                                idx
                            )))
                        }
                    }
                    dense.push((pending_dropout.take(), d_in, units));
                }
            }
        }

        if !final_softmax {
            return Err(config_error("the last layer must be a softmax dense layer"));
        }

        Ok(Plan {
            conv,
            dense,
            feature_size: flattened.unwrap_or(0),
        })
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Configuration(message.into())
}

/// Convolution, relu and max pooling.
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    pub conv: Conv2d<B>,
    pub pool: MaxPool2d,
    pub activation: Relu,
}

impl<B: Backend> ConvStage<B> {
    fn new(in_channels: usize, filters: usize, kernel: usize, window: usize, device: &B::Device) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, filters], [kernel, kernel]).init(device),
            pool: MaxPool2dConfig::new([window, window])
                .with_strides([window, window])
                .init(),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        self.pool.forward(x)
    }
}

/// Optional dropout followed by a linear layer.
#[derive(Module, Debug)]
pub struct DenseStage<B: Backend> {
    pub dropout: Option<Dropout>,
    pub linear: Linear<B>,
}

impl<B: Backend> DenseStage<B> {
    fn new(dropout: Option<f64>, d_in: usize, d_out: usize, device: &B::Device) -> Self {
        Self {
            dropout: dropout.map(|rate| DropoutConfig::new(rate).init()),
            linear: LinearConfig::new(d_in, d_out).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };
        self.linear.forward(x)
    }
}

/// Chest X-ray classifier CNN built from an [`ArchitectureSpec`].
#[derive(Module, Debug)]
pub struct ConvClassifier<B: Backend> {
    pub stages: Vec<ConvStage<B>>,
    pub hidden: Vec<DenseStage<B>>,
    pub output: DenseStage<B>,
    activation: Relu,
    num_classes: usize,
}

impl<B: Backend> ConvClassifier<B> {
    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, channels, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = x;
        for stage in &self.stages {
            x = stage.forward(x);
        }

        let [batch_size, channels, height, width] = x.dims();
        let mut x = x.reshape([batch_size, channels * height * width]);

        for stage in &self.hidden {
            x = self.activation.forward(stage.forward(x));
        }
        self.output.forward(x)
    }

    /// Forward pass with softmax for inference
    pub fn forward_softmax(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        burn::tensor::activation::softmax(self.forward(x), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn small(size: usize) -> ArchitectureSpec {
        ArchitectureSpec::standard_for(
            InputShape {
                height: size,
                width: size,
                channels: 1,
            },
            3,
        )
    }

    #[test]
    fn test_standard_feature_size() {
        let spec = ArchitectureSpec::standard();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.feature_size().unwrap(), 26 * 26 * 128);
    }

    #[test]
    fn test_standard_parameter_count() {
        let spec = ArchitectureSpec::standard();
        let expected = (3 * 3 * 3 * 32 + 32)
            + (3 * 3 * 32 * 64 + 64)
            + (3 * 3 * 64 * 128 + 128)
            + (26 * 26 * 128 * 512 + 512)
            + (512 * 3 + 3);
        assert_eq!(spec.parameter_count().unwrap(), expected);
    }

    #[test]
    fn test_minimum_input_size() {
        assert_eq!(small(22).feature_size().unwrap(), 128);
        let err = small(21).validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_invalid_layers_rejected() {
        let base = ArchitectureSpec::standard();

        let mut spec = base.clone();
        spec.layers[7] = LayerSpec::Dropout { rate: 1.0 };
        assert!(spec.validate().unwrap_err().is_configuration());

        let mut spec = base.clone();
        spec.layers.remove(1);
        assert!(spec.validate().is_err(), "conv without pooling");

        let mut spec = base.clone();
        spec.layers.pop();
        assert!(spec.validate().is_err(), "missing softmax output");

        let mut spec = base.clone();
        spec.num_classes = 4;
        assert!(spec.validate().is_err(), "output units disagree with classes");

        let mut spec = base.clone();
        spec.layers.remove(6);
        assert!(spec.validate().is_err(), "dense before flatten");

        let mut spec = base;
        spec.input.channels = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_json_round_trip() {
        let spec = small(32);
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"type\":\"max_pool\""));
        let back: ArchitectureSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model: ConvClassifier<TestBackend> = small(22).init(&device).unwrap();
        assert_eq!(model.stages.len(), 3);
        assert_eq!(model.hidden.len(), 1);
        assert_eq!(model.num_classes(), 3);

        let input = Tensor::<TestBackend, 4>::random([2, 1, 22, 22], Distribution::Default, &device);
        let probs = model.forward_softmax(input);
        assert_eq!(probs.dims(), [2, 3]);

        let sums = probs.sum_dim(1).into_data().to_vec::<f32>().unwrap();
        for sum in sums {
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }
}

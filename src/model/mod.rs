pub mod autoencoder;
pub mod classifier;
pub mod layers;

use burn::nn::loss::{MseLoss, Reduction};
use burn::prelude::*;

pub use autoencoder::{Autoencoder, AutoencoderConfig};
pub use classifier::{Classifier, ClassifierConfig};

/// Hyperparameters for the autoencoder and the classifier.
#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 1)]
    pub channels: usize,
    /// Side length of the square input images; must be divisible by 4.
    #[config(default = 64)]
    pub image_size: usize,
    #[config(default = 16)]
    pub autoencoder_dim: usize,
    #[config(default = 16)]
    pub classifier_dim: usize,
}

impl ModelConfig {
    pub fn autoencoder_config(&self) -> AutoencoderConfig {
        AutoencoderConfig::new(self.channels, self.autoencoder_dim)
    }

    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig::new(self.channels, self.classifier_dim, self.image_size)
    }

    pub fn init_autoencoder<B: Backend>(&self, device: &B::Device) -> Autoencoder<B> {
        self.autoencoder_config().init(device)
    }

    pub fn init_classifier<B: Backend>(&self, device: &B::Device) -> Classifier<B> {
        self.classifier_config().init(device)
    }

    /// Number of scalars in one CHW image.
    pub fn sample_len(&self) -> usize {
        self.channels * self.image_size * self.image_size
    }
}

/// Classification loss on real images together with the scores it was computed from.
#[derive(Debug)]
pub struct ClassificationLoss<B: Backend> {
    pub loss: Tensor<B, 1>,
    pub predictions: Tensor<B, 2>,
}

/// Autoencoder loss terms and the reconstruction they were computed from.
#[derive(Debug)]
pub struct GeneratorLosses<B: Backend> {
    pub similarity: Tensor<B, 1>,
    pub adversarial: Tensor<B, 1>,
    pub total: Tensor<B, 1>,
    pub reconstruction: Tensor<B, 4>,
}

/// All losses for one batch, used for evaluation.
#[derive(Debug)]
pub struct CoupledLosses<B: Backend> {
    pub classification: ClassificationLoss<B>,
    pub generator: GeneratorLosses<B>,
}

/// MSE between the classifier's scores on real images and the true labels.
pub fn classification_loss<B: Backend>(
    classifier: &Classifier<B>,
    images: Tensor<B, 4>,
    labels: Tensor<B, 2>,
) -> ClassificationLoss<B> {
    let predictions = classifier.forward(images);
    let loss = MseLoss::new().forward(predictions.clone(), labels, Reduction::Mean);
    ClassificationLoss { loss, predictions }
}

/// Reconstruction MSE plus MSE between the classifier's verdict on the
/// reconstruction and an all-zero target.
pub fn generator_losses<B: Backend>(
    autoencoder: &Autoencoder<B>,
    classifier: &Classifier<B>,
    images: Tensor<B, 4>,
) -> GeneratorLosses<B> {
    let mse = MseLoss::new();
    let reconstruction = autoencoder.forward(images.clone());
    let similarity = mse.forward(reconstruction.clone(), images, Reduction::Mean);

    let verdict = classifier.forward(reconstruction.clone());
    let target = verdict.zeros_like();
    let adversarial = mse.forward(verdict, target, Reduction::Mean);

    let total = similarity.clone().add(adversarial.clone());
    GeneratorLosses {
        similarity,
        adversarial,
        total,
        reconstruction,
    }
}

/// Compute every loss for a batch with the current weights.
pub fn compute_losses<B: Backend>(
    autoencoder: &Autoencoder<B>,
    classifier: &Classifier<B>,
    images: Tensor<B, 4>,
    labels: Tensor<B, 2>,
) -> CoupledLosses<B> {
    let classification = classification_loss(classifier, images.clone(), labels);
    let generator = generator_losses(autoencoder, classifier, images);
    CoupledLosses {
        classification,
        generator,
    }
}

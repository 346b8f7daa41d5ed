//! TalkingHeads wrapper combining Embedder, Generator and Discriminator
//!
//! Embedder and generator share one variable store so a single optimizer
//! covers both. Each network still saves to its own file.

use std::path::Path;
use tch::{nn, nn::OptimizerConfig, nn::VarStore, Device, Tensor};

use super::{Discriminator, Embedder, Generator, Network, NetworkConfig};
use crate::error::{Error, Result};

/// Complete talking heads model
pub struct TalkingHeads {
    /// Embedder network
    pub embedder: Embedder,
    /// Generator network
    pub generator: Generator,
    /// Discriminator network
    pub discriminator: Discriminator,
    /// Variable store for embedder and generator
    pub eg_vs: VarStore,
    /// Variable store for discriminator
    pub d_vs: VarStore,
    /// Device (CPU/GPU)
    pub device: Device,
    config: NetworkConfig,
}

impl TalkingHeads {
    /// Create a new model
    ///
    /// # Arguments
    ///
    /// * `config` - Channel layout shared by the three networks
    /// * `num_videos` - Number of training videos (discriminator columns)
    /// * `device` - Device to create model on
    pub fn new(config: NetworkConfig, num_videos: i64, device: Device) -> Self {
        let eg_vs = VarStore::new(device);
        let d_vs = VarStore::new(device);

        let embedder = Embedder::new(&(eg_vs.root() / Network::Embedder.prefix()), config);
        let generator = Generator::new(&(eg_vs.root() / Network::Generator.prefix()), config);
        let discriminator = Discriminator::new(
            &(d_vs.root() / Network::Discriminator.prefix()),
            config,
            num_videos,
        );

        Self {
            embedder,
            generator,
            discriminator,
            eg_vs,
            d_vs,
            device,
            config,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Variable store holding `network`
    pub fn var_store(&self, network: Network) -> &VarStore {
        match network {
            Network::Embedder | Network::Generator => &self.eg_vs,
            Network::Discriminator => &self.d_vs,
        }
    }

    /// Adam over embedder and generator parameters
    pub fn eg_optimizer(&self, lr: f64) -> Result<nn::Optimizer> {
        Ok(nn::Adam::default().build(&self.eg_vs, lr)?)
    }

    /// Adam over discriminator parameters
    pub fn d_optimizer(&self, lr: f64) -> Result<nn::Optimizer> {
        Ok(nn::Adam::default().build(&self.d_vs, lr)?)
    }

    /// Average embedding of K frames
    ///
    /// # Arguments
    ///
    /// * `x` - Frames of shape (K, 3, size, size)
    /// * `y` - Matching landmark sketches
    ///
    /// # Returns
    ///
    /// `e_hat` of shape (1, embedding_length, 1)
    pub fn embed(&self, x: &Tensor, y: &Tensor, train: bool) -> Tensor {
        self.embedder.embed_average(x, y, train)
    }

    /// Render the landmark sketches `y` in the identity `e_hat`
    ///
    /// Runs in evaluation mode without gradient tracking.
    pub fn synthesize(&self, y: &Tensor, e_hat: &Tensor) -> Tensor {
        tch::no_grad(|| {
            let batch = y.size()[0];
            let e = e_hat.expand([batch, -1, -1], false);
            self.generator.forward_t(y, &e, false)
        })
    }

    /// Named tensors of one network, with the network prefix kept
    pub fn network_variables(&self, network: Network) -> Vec<(String, Tensor)> {
        let prefix = format!("{}.", network.prefix());
        let mut vars: Vec<_> = self
            .var_store(network)
            .variables()
            .into_iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        vars
    }

    /// Save one network's weights to `path`
    pub fn save_network(&self, network: Network, path: impl AsRef<Path>) -> Result<()> {
        let vars = self.network_variables(network);
        let named: Vec<(&str, Tensor)> = vars
            .iter()
            .map(|(name, t)| (name.as_str(), t.to_device(Device::Cpu)))
            .collect();
        Tensor::save_multi(&named, path)?;
        Ok(())
    }

    /// Load one network's weights from `path`
    ///
    /// Every variable of the network must be present with a matching shape.
    pub fn load_network(&mut self, network: Network, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Checkpoint(format!(
                "{} checkpoint {} not found",
                network.name(),
                path.display()
            )));
        }

        let loaded = Tensor::load_multi_with_device(path, self.device)?;
        for (name, var) in self.network_variables(network) {
            let value = loaded
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, t)| t)
                .ok_or_else(|| {
                    Error::Checkpoint(format!("{} is missing from {}", name, path.display()))
                })?;
            if value.size() != var.size() {
                return Err(Error::Checkpoint(format!(
                    "{} has shape {:?} in {}, expected {:?}",
                    name,
                    value.size(),
                    path.display(),
                    var.size()
                )));
            }
            tch::no_grad(|| {
                var.shallow_clone().copy_(value);
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Kind;

    fn model() -> TalkingHeads {
        TalkingHeads::new(NetworkConfig::tiny(), 3, Device::Cpu)
    }

    #[test]
    fn test_networks_use_separate_prefixes() {
        let model = model();
        let e = model.network_variables(Network::Embedder);
        let g = model.network_variables(Network::Generator);
        let d = model.network_variables(Network::Discriminator);

        assert!(!e.is_empty() && !g.is_empty() && !d.is_empty());
        assert_eq!(
            e.len() + g.len(),
            model.eg_vs.variables().len(),
            "embedder and generator split the shared store"
        );
        assert!(d.iter().any(|(n, _)| n == "discriminator.W"));
    }

    #[test]
    fn test_synthesize_shape() {
        let model = model();
        let x = Tensor::randn([2, 3, 128, 128], (Kind::Float, Device::Cpu));
        let y = Tensor::randn([2, 3, 128, 128], (Kind::Float, Device::Cpu));

        let e_hat = model.embed(&x, &y, false);
        assert_eq!(e_hat.size(), vec![1, 16, 1]);

        let x_hat = model.synthesize(&y, &e_hat);
        assert_eq!(x_hat.size(), vec![2, 3, 128, 128]);
        assert!(!x_hat.requires_grad());
    }

    #[test]
    fn test_save_load_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Generator_test.pt");

        let source = model();
        source.save_network(Network::Generator, &path).unwrap();

        let mut target = model();
        target.load_network(Network::Generator, &path).unwrap();

        for ((n1, t1), (n2, t2)) in source
            .network_variables(Network::Generator)
            .iter()
            .zip(target.network_variables(Network::Generator).iter())
        {
            assert_eq!(n1, n2);
            assert!(t1.equal(t2), "{} differs after reload", n1);
        }
    }

    #[test]
    fn test_load_network_rejects_wrong_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Embedder_test.pt");

        let mut model = model();
        assert!(model.load_network(Network::Embedder, &path).is_err());

        model.save_network(Network::Embedder, &path).unwrap();
        assert!(model.load_network(Network::Generator, &path).is_err());
    }

    #[test]
    fn test_optimizers_build() {
        let model = model();
        assert!(model.eg_optimizer(5e-5).is_ok());
        assert!(model.d_optimizer(2e-4).is_ok());
    }
}

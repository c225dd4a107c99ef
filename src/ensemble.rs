// mlbreaker: Online ensemble regressor
//
// Three small feed-forward networks trained online, diversified by hidden
// width, momentum, regularization and learning rate. The ensemble output is
// an error-weighted blend in [0, 1].

use crate::error::{MlError, MlResult};
use rand::Rng;

/// Number of networks in the ensemble
pub const ENSEMBLE_SIZE: usize = 3;

/// Hidden-layer widths, one per network
pub const HIDDEN_SIZES: [usize; ENSEMBLE_SIZE] = [4, 6, 8];

/// Base learning rate; individual nets vary it by ±20%
pub const BASE_LEARNING_RATE: f64 = 0.01;

const SIGMOID_CLAMP: f64 = 20.0;
const DEGENERATE_ERROR: f64 = 1e-4;

const MODEL_MAGIC: &[u8; 4] = b"MLCB";
const MODEL_VERSION: u16 = 1;

/// One feed-forward network: dense ReLU hidden layer, single sigmoid output,
/// momentum updates with L2 decay on weights (not biases).
#[derive(Debug, Clone)]
struct OnlineNet {
    input: usize,
    hidden: usize,
    w1: Vec<f64>, // hidden x input, row-major
    b1: Vec<f64>,
    w2: Vec<f64>,
    b2: f64,
    vw1: Vec<f64>,
    vb1: Vec<f64>,
    vw2: Vec<f64>,
    vb2: f64,
    learning_rate: f64,
    momentum: f64,
    l2: f64,
}

/// Accumulated gradients for one update step
struct Gradients {
    dw1: Vec<f64>,
    db1: Vec<f64>,
    dw2: Vec<f64>,
    db2: f64,
}

impl OnlineNet {
    fn new(input: usize, hidden: usize, learning_rate: f64, momentum: f64, l2: f64) -> Self {
        // Xavier initialization scaled to fan-in + fan-out
        let scale = (2.0 / (input + hidden) as f64).sqrt();
        let mut rng = rand::thread_rng();

        let w1 = (0..hidden * input)
            .map(|_| rng.gen_range(-scale..scale))
            .collect();
        let w2 = (0..hidden).map(|_| rng.gen_range(-scale..scale)).collect();

        Self {
            input,
            hidden,
            w1,
            b1: vec![0.0; hidden],
            w2,
            b2: 0.0,
            vw1: vec![0.0; hidden * input],
            vb1: vec![0.0; hidden],
            vw2: vec![0.0; hidden],
            vb2: 0.0,
            learning_rate,
            momentum,
            l2,
        }
    }

    /// Forward pass returning hidden pre-activations, activations and output
    fn forward(&self, x: &[f64]) -> (Vec<f64>, Vec<f64>, f64) {
        let mut pre = vec![0.0; self.hidden];
        let mut act = vec![0.0; self.hidden];
        for j in 0..self.hidden {
            let mut sum = self.b1[j];
            let row = &self.w1[j * self.input..(j + 1) * self.input];
            for (w, xi) in row.iter().zip(x.iter()) {
                sum += w * xi;
            }
            pre[j] = sum;
            act[j] = sum.max(0.0);
        }

        let mut out = self.b2;
        for (w, h) in self.w2.iter().zip(act.iter()) {
            out += w * h;
        }

        (pre, act, sigmoid(out))
    }

    fn predict(&self, x: &[f64]) -> f64 {
        self.forward(x).2
    }

    /// Squared-error gradients for one example, L2 applied to weights only
    fn gradients(&self, x: &[f64], target: f64) -> Gradients {
        let (pre, act, output) = self.forward(x);

        let delta_out = (output - target) * output * (1.0 - output);

        let mut dw2 = vec![0.0; self.hidden];
        let mut delta_hidden = vec![0.0; self.hidden];
        for j in 0..self.hidden {
            dw2[j] = delta_out * act[j] + self.l2 * self.w2[j];
            delta_hidden[j] = if pre[j] > 0.0 {
                delta_out * self.w2[j]
            } else {
                0.0
            };
        }

        let mut dw1 = vec![0.0; self.hidden * self.input];
        let mut db1 = vec![0.0; self.hidden];
        for j in 0..self.hidden {
            for (i, xi) in x.iter().enumerate() {
                let k = j * self.input + i;
                dw1[k] = delta_hidden[j] * xi + self.l2 * self.w1[k];
            }
            db1[j] = delta_hidden[j];
        }

        Gradients {
            dw1,
            db1,
            dw2,
            db2: delta_out,
        }
    }

    /// Momentum step: v <- mu*v - lr*grad, w <- w + v
    fn apply(&mut self, grads: &Gradients) {
        for (k, g) in grads.dw1.iter().enumerate() {
            self.vw1[k] = self.momentum * self.vw1[k] - self.learning_rate * g;
            self.w1[k] += self.vw1[k];
        }
        for (j, g) in grads.db1.iter().enumerate() {
            self.vb1[j] = self.momentum * self.vb1[j] - self.learning_rate * g;
            self.b1[j] += self.vb1[j];
        }
        for (j, g) in grads.dw2.iter().enumerate() {
            self.vw2[j] = self.momentum * self.vw2[j] - self.learning_rate * g;
            self.w2[j] += self.vw2[j];
        }
        self.vb2 = self.momentum * self.vb2 - self.learning_rate * grads.db2;
        self.b2 += self.vb2;
    }

    fn learn(&mut self, x: &[f64], target: f64) {
        let grads = self.gradients(x, target);
        self.apply(&grads);
    }

    /// Average gradients over a batch, then a single momentum update
    fn learn_batch(&mut self, xs: &[Vec<f64>], targets: &[f64]) {
        if xs.is_empty() {
            return;
        }

        let mut total = Gradients {
            dw1: vec![0.0; self.hidden * self.input],
            db1: vec![0.0; self.hidden],
            dw2: vec![0.0; self.hidden],
            db2: 0.0,
        };

        for (x, target) in xs.iter().zip(targets.iter()) {
            let grads = self.gradients(x, *target);
            for (acc, g) in total.dw1.iter_mut().zip(grads.dw1.iter()) {
                *acc += g;
            }
            for (acc, g) in total.db1.iter_mut().zip(grads.db1.iter()) {
                *acc += g;
            }
            for (acc, g) in total.dw2.iter_mut().zip(grads.dw2.iter()) {
                *acc += g;
            }
            total.db2 += grads.db2;
        }

        let n = xs.len() as f64;
        for g in total.dw1.iter_mut() {
            *g /= n;
        }
        for g in total.db1.iter_mut() {
            *g /= n;
        }
        for g in total.dw2.iter_mut() {
            *g /= n;
        }
        total.db2 /= n;

        self.apply(&total);
    }
}

fn sigmoid(x: f64) -> f64 {
    let clamped = x.clamp(-SIGMOID_CLAMP, SIGMOID_CLAMP);
    1.0 / (1.0 + (-clamped).exp())
}

/// Ensemble of diversified online networks with error-weighted voting
pub struct EnsembleRegressor {
    nets: Vec<OnlineNet>,
    weights: Vec<f64>,
    input: usize,
}

impl EnsembleRegressor {
    /// Build the ensemble for a given input width
    pub fn new(input: usize) -> MlResult<Self> {
        Self::with_base_learning_rate(input, BASE_LEARNING_RATE)
    }

    pub fn with_base_learning_rate(input: usize, base_lr: f64) -> MlResult<Self> {
        if input == 0 {
            return Err(MlError::Model("Ensemble input width must be > 0".to_string()));
        }
        if !base_lr.is_finite() || base_lr <= 0.0 {
            return Err(MlError::Model(format!(
                "Invalid base learning rate: {}",
                base_lr
            )));
        }

        let nets = HIDDEN_SIZES
            .iter()
            .enumerate()
            .map(|(k, &hidden)| {
                // Diversification: momentum decreasing, L2 increasing, and
                // the learning rate spread ±20% around the base.
                let momentum = 0.9 - 0.1 * k as f64;
                let l2 = 1e-3 * (k + 1) as f64;
                let lr = base_lr * (0.8 + 0.2 * k as f64);
                OnlineNet::new(input, hidden, lr, momentum, l2)
            })
            .collect();

        Ok(Self {
            nets,
            weights: vec![1.0 / ENSEMBLE_SIZE as f64; ENSEMBLE_SIZE],
            input,
        })
    }

    pub fn input_width(&self) -> usize {
        self.input
    }

    /// Current ensemble weights (non-negative, summing to 1)
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Weighted ensemble prediction in [0, 1]
    pub fn predict(&self, x: &[f64]) -> f64 {
        let blended: f64 = self
            .nets
            .iter()
            .zip(self.weights.iter())
            .map(|(net, w)| w * net.predict(x))
            .sum();
        blended.clamp(0.0, 1.0)
    }

    /// Train every net on one example and rebalance the ensemble weights
    pub fn learn(&mut self, x: &[f64], target: f64) {
        let errors: Vec<f64> = self
            .nets
            .iter()
            .map(|net| (net.predict(x) - target).abs())
            .collect();

        for net in self.nets.iter_mut() {
            net.learn(x, target);
        }

        self.reweight(&errors);
    }

    /// Train every net on a batch and rebalance using mean absolute error
    pub fn learn_batch(&mut self, xs: &[Vec<f64>], targets: &[f64]) {
        if xs.is_empty() || xs.len() != targets.len() {
            return;
        }

        let errors: Vec<f64> = self
            .nets
            .iter()
            .map(|net| {
                xs.iter()
                    .zip(targets.iter())
                    .map(|(x, t)| (net.predict(x) - t).abs())
                    .sum::<f64>()
                    / xs.len() as f64
            })
            .collect();

        for net in self.nets.iter_mut() {
            net.learn_batch(xs, targets);
        }

        self.reweight(&errors);
    }

    /// Weight each net proportionally to how much better it did than the
    /// ensemble's total error; degenerate (all near-zero) resets to uniform.
    fn reweight(&mut self, errors: &[f64]) {
        let total: f64 = errors.iter().sum();

        if errors.iter().all(|e| *e <= DEGENERATE_ERROR) {
            self.weights = vec![1.0 / self.nets.len() as f64; self.nets.len()];
            return;
        }

        let raw: Vec<f64> = errors.iter().map(|e| (total - e).max(0.0)).collect();
        let raw_sum: f64 = raw.iter().sum();
        if raw_sum <= 0.0 {
            self.weights = vec![1.0 / self.nets.len() as f64; self.nets.len()];
            return;
        }

        self.weights = raw.iter().map(|w| w / raw_sum).collect();
    }

    /// Serialize the full ensemble state into the versioned byte layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MODEL_MAGIC);
        out.extend_from_slice(&MODEL_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.input as u32).to_le_bytes());
        out.extend_from_slice(&(self.nets.len() as u32).to_le_bytes());

        for net in &self.nets {
            out.extend_from_slice(&(net.hidden as u32).to_le_bytes());
            out.extend_from_slice(&net.learning_rate.to_le_bytes());
            out.extend_from_slice(&net.momentum.to_le_bytes());
            out.extend_from_slice(&net.l2.to_le_bytes());
            write_f64s(&mut out, &net.w1);
            write_f64s(&mut out, &net.b1);
            write_f64s(&mut out, &net.w2);
            out.extend_from_slice(&net.b2.to_le_bytes());
            write_f64s(&mut out, &net.vw1);
            write_f64s(&mut out, &net.vb1);
            write_f64s(&mut out, &net.vw2);
            out.extend_from_slice(&net.vb2.to_le_bytes());
        }

        write_f64s(&mut out, &self.weights);
        out
    }

    /// Restore an ensemble from the versioned byte layout.
    ///
    /// Unknown magic or version, or a truncated payload, fails closed.
    pub fn from_bytes(bytes: &[u8]) -> MlResult<Self> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.take(4)?;
        if magic != MODEL_MAGIC {
            return Err(MlError::Serialization("Unrecognized model magic".to_string()));
        }
        let version = reader.u16()?;
        if version != MODEL_VERSION {
            return Err(MlError::Serialization(format!(
                "Unsupported model version: {}",
                version
            )));
        }

        let input = reader.u32()? as usize;
        let net_count = reader.u32()? as usize;
        if input == 0 || net_count == 0 || net_count > 64 {
            return Err(MlError::Serialization(
                "Implausible model dimensions".to_string(),
            ));
        }

        let mut nets = Vec::with_capacity(net_count);
        for _ in 0..net_count {
            let hidden = reader.u32()? as usize;
            if hidden == 0 || hidden > 4096 {
                return Err(MlError::Serialization(
                    "Implausible hidden width".to_string(),
                ));
            }
            let learning_rate = reader.f64()?;
            let momentum = reader.f64()?;
            let l2 = reader.f64()?;
            let w1 = reader.f64s(hidden * input)?;
            let b1 = reader.f64s(hidden)?;
            let w2 = reader.f64s(hidden)?;
            let b2 = reader.f64()?;
            let vw1 = reader.f64s(hidden * input)?;
            let vb1 = reader.f64s(hidden)?;
            let vw2 = reader.f64s(hidden)?;
            let vb2 = reader.f64()?;

            nets.push(OnlineNet {
                input,
                hidden,
                w1,
                b1,
                w2,
                b2,
                vw1,
                vb1,
                vw2,
                vb2,
                learning_rate,
                momentum,
                l2,
            });
        }

        let weights = reader.f64s(net_count)?;
        reader.expect_end()?;

        Ok(Self {
            nets,
            weights,
            input,
        })
    }
}

fn write_f64s(out: &mut Vec<u8>, values: &[f64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> MlResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(MlError::Serialization("Truncated model payload".to_string()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> MlResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> MlResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> MlResult<f64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }

    fn f64s(&mut self, n: usize) -> MlResult<Vec<f64>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.f64()?);
        }
        Ok(out)
    }

    fn expect_end(&self) -> MlResult<()> {
        if self.pos != self.bytes.len() {
            return Err(MlError::Serialization(
                "Trailing bytes after model payload".to_string(),
            ));
        }
        Ok(())
    }
}

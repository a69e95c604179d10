//! Reduce-on-plateau learning rate scheduler
use candle_nn::Optimizer;

/// Plateau scheduler configuration
#[derive(Debug, Clone)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau
    pub factor: f64,
    /// Epochs without improvement tolerated before reducing
    pub patience: usize,
    /// Relative improvement needed to count as better
    pub threshold: f64,
    /// Epochs to wait after a reduction before counting again
    pub cooldown: usize,
    /// Lower bound on the learning rate
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.1,
            patience: 10,
            threshold: 1e-4,
            cooldown: 0,
            min_lr: 0.0,
        }
    }
}

/// Reduce-on-plateau scheduler
///
/// Tracks a monitored metric (lower is better). After more than `patience`
/// epochs without relative improvement of at least `threshold`, the learning
/// rate is multiplied by `factor`.
#[derive(Debug, Clone)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    lr: f64,
    best: Option<f64>,
    bad_epochs: usize,
    cooldown_left: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(lr_init: f64, config: PlateauConfig) -> Self {
        Self {
            config,
            lr: lr_init,
            best: None,
            bad_epochs: 0,
            cooldown_left: 0,
        }
    }

    /// Get current learning rate
    pub fn get_lr(&self) -> f64 {
        self.lr
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    /// Record the metric of one epoch and return the learning rate to use next.
    pub fn step(&mut self, metric: f64) -> f64 {
        let improved = match self.best {
            None => true,
            Some(best) => metric < best * (1.0 - self.config.threshold),
        };

        if improved {
            self.best = Some(metric);
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }

        if self.cooldown_left > 0 {
            self.cooldown_left -= 1;
            self.bad_epochs = 0;
        }

        if self.bad_epochs > self.config.patience {
            let reduced = (self.lr * self.config.factor).max(self.config.min_lr);
            if self.lr - reduced > f64::EPSILON {
                log::info!("Reducing learning rate {:.3e} -> {:.3e}", self.lr, reduced);
                self.lr = reduced;
            }
            self.cooldown_left = self.config.cooldown;
            self.bad_epochs = 0;
        }

        self.lr
    }

    /// Step on `metric` and push the resulting learning rate into `optimizer`.
    pub fn step_optimizer<O: Optimizer>(&mut self, metric: f64, optimizer: &mut O) -> f64 {
        let lr = self.step(metric);
        optimizer.set_learning_rate(lr);
        lr
    }
}

use crate::candle_aux_layers::{conv_bn_stack, ConvBnStack};
use crate::candle_model_traits::{ScoreInputs, ScoringModuleT};

use candle_core::{Result, Tensor};
use candle_nn::init::Init;
use candle_nn::{ops, Embedding, Linear, Module, ModuleT, VarBuilder};
use std::fmt::Write as _;
use std::str::FromStr;

/// N(0, 0.01^2) initial scale of the identity embedding tables.
const ID_EMBEDDING_INIT_SD: f64 = 0.01;

/// How the pairwise attribute interaction map is digested before fusion.
///
/// * `Local` - convolution blocks over the interaction map
/// * `Global` - the raw interaction map, flattened
/// * `Combined` - both, concatenated (convolution features first)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouplingMode {
    Local,
    Global,
    Combined,
}

impl CouplingMode {
    pub fn name(&self) -> &'static str {
        match self {
            CouplingMode::Local => "local",
            CouplingMode::Global => "global",
            CouplingMode::Combined => "combined",
        }
    }
}

impl FromStr for CouplingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(CouplingMode::Local),
            "global" => Ok(CouplingMode::Global),
            "combined" => Ok(CouplingMode::Combined),
            _ => anyhow::bail!(
                "unknown coupling architecture `{}` (expected: local, global, combined)",
                s
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CoupledCfConfig {
    pub num_users: usize,
    pub num_items: usize,
    /// width of a raw user attribute vector
    pub dim_user_attr: usize,
    /// width of a raw item attribute vector
    pub dim_item_attr: usize,
    /// attribute latent width, the interaction map is `d x d`
    pub dim_attr_latent: usize,
    /// attribute-side representation width
    pub dim_attr_out: usize,
    /// identity embedding width
    pub dim_id_embed: usize,
    /// identity-side representation width
    pub dim_id_out: usize,
    /// fused hidden width before the scoring unit
    pub dim_fusion: usize,
    pub num_filters: usize,
    pub kernel_size: usize,
    pub conv_depth: usize,
    pub mode: CouplingMode,
}

impl CoupledCfConfig {
    pub fn new(
        num_users: usize,
        num_items: usize,
        dim_user_attr: usize,
        dim_item_attr: usize,
        mode: CouplingMode,
    ) -> Self {
        Self {
            num_users,
            num_items,
            dim_user_attr,
            dim_item_attr,
            dim_attr_latent: 8,
            dim_attr_out: 16,
            dim_id_embed: 32,
            dim_id_out: 32,
            dim_fusion: 64,
            num_filters: 8,
            kernel_size: 3,
            conv_depth: 2,
            mode,
        }
    }

    /// Spatial side of the interaction map after all convolution blocks.
    pub fn conv_out_side(&self) -> usize {
        self.dim_attr_latent
            .saturating_sub(self.conv_depth * (self.kernel_size - 1))
    }

    /// Flattened width of the convolution-refined interaction features.
    pub fn conv_flat_dim(&self) -> usize {
        self.num_filters * self.conv_out_side() * self.conv_out_side()
    }

    /// Flattened width of the raw interaction map.
    pub fn global_flat_dim(&self) -> usize {
        self.dim_attr_latent * self.dim_attr_latent
    }

    /// Input width of the attribute-side projection for this mode.
    pub fn attr_feature_dim(&self) -> usize {
        match self.mode {
            CouplingMode::Local => self.conv_flat_dim(),
            CouplingMode::Global => self.global_flat_dim(),
            CouplingMode::Combined => self.conv_flat_dim() + self.global_flat_dim(),
        }
    }

    /// Reject malformed settings before any parameter is allocated.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.num_users > 0, "num_users must be positive");
        anyhow::ensure!(self.num_items > 0, "num_items must be positive");
        anyhow::ensure!(self.dim_user_attr > 0, "user attribute width must be positive");
        anyhow::ensure!(self.dim_item_attr > 0, "item attribute width must be positive");
        for (name, dim) in [
            ("dim_attr_latent", self.dim_attr_latent),
            ("dim_attr_out", self.dim_attr_out),
            ("dim_id_embed", self.dim_id_embed),
            ("dim_id_out", self.dim_id_out),
            ("dim_fusion", self.dim_fusion),
        ] {
            anyhow::ensure!(dim > 0, "{} must be positive", name);
        }
        if self.mode != CouplingMode::Global {
            anyhow::ensure!(
                self.kernel_size > 1 && self.conv_depth > 0,
                "convolution blocks need kernel_size > 1 and conv_depth > 0"
            );
            anyhow::ensure!(
                self.conv_out_side() > 0,
                "{} convolution blocks of kernel {} exhaust an {}x{} interaction map",
                self.conv_depth,
                self.kernel_size,
                self.dim_attr_latent,
                self.dim_attr_latent
            );
        }
        Ok(())
    }
}

/// Coupled attribute-identity scoring model.
///
/// Attribute side: two independent affine+relu encoders, an outer-product
/// interaction map digested according to [`CouplingMode`], then one more
/// affine+relu. Identity side: per-id embeddings combined element-wise.
/// Both representations are concatenated and reduced to one sigmoid score.
pub struct CoupledCf {
    user_attr_proj: Linear,
    item_attr_proj: Linear,
    conv: Option<ConvBnStack>,
    attr_out: Linear,
    user_emb: Embedding,
    item_emb: Embedding,
    id_out: Linear,
    fusion: Linear,
    top: Linear,
    config: CoupledCfConfig,
}

impl CoupledCf {
    /// Allocate all parameters under `vb`. The embedding tables reserve
    /// one extra row (index `num_users` / `num_items`) that is never
    /// referenced by a valid id.
    pub fn new(config: CoupledCfConfig, vb: VarBuilder) -> Result<Self> {
        let user_attr_proj = candle_nn::linear(
            config.dim_user_attr,
            config.dim_attr_latent,
            vb.pp("user_attr_proj"),
        )?;
        let item_attr_proj = candle_nn::linear(
            config.dim_item_attr,
            config.dim_attr_latent,
            vb.pp("item_attr_proj"),
        )?;

        let conv = match config.mode {
            CouplingMode::Global => None,
            _ => Some(conv_bn_stack(
                config.num_filters,
                config.kernel_size,
                config.conv_depth,
                vb.pp("attr_conv"),
            )?),
        };

        let attr_out = candle_nn::linear(
            config.attr_feature_dim(),
            config.dim_attr_out,
            vb.pp("attr_out"),
        )?;

        let user_emb_ws = vb.get_with_hints(
            (config.num_users + 1, config.dim_id_embed),
            "user_emb.weight",
            Init::Randn {
                mean: 0.0,
                stdev: ID_EMBEDDING_INIT_SD,
            },
        )?;
        let user_emb = Embedding::new(user_emb_ws, config.dim_id_embed);

        let item_emb_ws = vb.get_with_hints(
            (config.num_items + 1, config.dim_id_embed),
            "item_emb.weight",
            Init::Randn {
                mean: 0.0,
                stdev: ID_EMBEDDING_INIT_SD,
            },
        )?;
        let item_emb = Embedding::new(item_emb_ws, config.dim_id_embed);

        let id_out = candle_nn::linear(config.dim_id_embed, config.dim_id_out, vb.pp("id_out"))?;

        let fusion = candle_nn::linear(
            config.dim_attr_out + config.dim_id_out,
            config.dim_fusion,
            vb.pp("fusion"),
        )?;
        let top = candle_nn::linear(config.dim_fusion, 1, vb.pp("top"))?;

        Ok(Self {
            user_attr_proj,
            item_attr_proj,
            conv,
            attr_out,
            user_emb,
            item_emb,
            id_out,
            fusion,
            top,
            config,
        })
    }

    pub fn config(&self) -> &CoupledCfConfig {
        &self.config
    }

    pub fn mode(&self) -> CouplingMode {
        self.config.mode
    }

    /// Pairwise interaction map between the two attribute latents (n x d x d).
    pub fn attr_interaction(&self, user_attr: &Tensor, item_attr: &Tensor) -> Result<Tensor> {
        let u_nd = self.user_attr_proj.forward(user_attr)?.relu()?;
        let v_nd = self.item_attr_proj.forward(item_attr)?.relu()?;
        // (n x d x 1) @ (n x 1 x d) -> n x d x d
        u_nd.unsqueeze(2)?.matmul(&v_nd.unsqueeze(1)?)
    }

    /// Attribute-side features right before the final attribute projection.
    ///
    /// For `Global` this is the flattened interaction map; for `Local` the
    /// flattened convolution output; for `Combined` their concatenation
    /// with convolution features first.
    pub fn attr_features(&self, user_attr: &Tensor, item_attr: &Tensor, train: bool) -> Result<Tensor> {
        let inter_ndd = self.attr_interaction(user_attr, item_attr)?;
        match (self.config.mode, self.conv.as_ref()) {
            (CouplingMode::Global, _) => inter_ndd.flatten_from(1),
            (CouplingMode::Local, Some(conv)) => {
                let local = conv.forward_t(&inter_ndd.unsqueeze(1)?, train)?;
                local.flatten_from(1)
            }
            (CouplingMode::Combined, Some(conv)) => {
                let local = conv.forward_t(&inter_ndd.unsqueeze(1)?, train)?;
                Tensor::cat(&[&local.flatten_from(1)?, &inter_ndd.flatten_from(1)?], 1)
            }
            _ => Err(candle_core::Error::Msg(
                "convolution blocks missing for a convolutional coupling mode".to_string(),
            )),
        }
    }

    /// One-line-per-layer description of the topology, for logs or a
    /// diagram sink.
    pub fn summary(&self) -> String {
        let cfg = &self.config;
        let mut out = String::new();
        let _ = writeln!(out, "CoupledCf ({})", cfg.mode.name());
        let _ = writeln!(
            out,
            "  user_attr_proj: linear {} -> {} (relu)",
            cfg.dim_user_attr, cfg.dim_attr_latent
        );
        let _ = writeln!(
            out,
            "  item_attr_proj: linear {} -> {} (relu)",
            cfg.dim_item_attr, cfg.dim_attr_latent
        );
        let _ = writeln!(
            out,
            "  attr_interaction: outer product {d} x {d}",
            d = cfg.dim_attr_latent
        );
        if let Some(conv) = &self.conv {
            let _ = writeln!(
                out,
                "  attr_conv: {} x (conv2d {f}@{k}x{k} -> batchnorm -> relu) -> {} flat",
                conv.num_blocks(),
                cfg.conv_flat_dim(),
                f = cfg.num_filters,
                k = cfg.kernel_size
            );
        }
        let _ = writeln!(
            out,
            "  attr_out: linear {} -> {} (relu)",
            cfg.attr_feature_dim(),
            cfg.dim_attr_out
        );
        let _ = writeln!(
            out,
            "  user_emb: embedding [{} x {}]",
            cfg.num_users + 1,
            cfg.dim_id_embed
        );
        let _ = writeln!(
            out,
            "  item_emb: embedding [{} x {}]",
            cfg.num_items + 1,
            cfg.dim_id_embed
        );
        let _ = writeln!(
            out,
            "  id_out: mul -> linear {} -> {} (relu)",
            cfg.dim_id_embed, cfg.dim_id_out
        );
        let _ = writeln!(
            out,
            "  fusion: concat {} -> linear -> {} (relu)",
            cfg.dim_attr_out + cfg.dim_id_out,
            cfg.dim_fusion
        );
        let _ = writeln!(out, "  top: linear {} -> 1 (sigmoid)", cfg.dim_fusion);
        out
    }
}

impl ScoringModuleT for CoupledCf {
    fn forward_t(&self, inputs: &ScoreInputs, train: bool) -> Result<Tensor> {
        let attr = self.attr_features(inputs.user_attr, inputs.item_attr, train)?;
        let attr_repr = self.attr_out.forward(&attr)?.relu()?;

        let u_ne = self.user_emb.forward(inputs.user_id)?;
        let i_ne = self.item_emb.forward(inputs.item_id)?;
        let id_repr = self.id_out.forward(&(u_ne * i_ne)?)?.relu()?;

        let fused = Tensor::cat(&[&attr_repr, &id_repr], 1)?;
        let hidden = self.fusion.forward(&fused)?.relu()?;
        let logit_n1 = self.top.forward(&hidden)?;
        ops::sigmoid(&logit_n1)?.squeeze(1)
    }

    fn num_users(&self) -> usize {
        self.config.num_users
    }

    fn num_items(&self) -> usize {
        self.config.num_items
    }
}

use coupled_util::candle_coupled_model::{CoupledCf, CoupledCfConfig, CouplingMode};
use coupled_util::candle_model_traits::{ScoreInputs, ScoringModuleT};

use approx::assert_abs_diff_eq;
use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

const NUM_USERS: usize = 6;
const NUM_ITEMS: usize = 9;
const DIM_USER_ATTR: usize = 30;
const DIM_ITEM_ATTR: usize = 18;

fn build(mode: CouplingMode) -> Result<(CoupledCf, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let config = CoupledCfConfig::new(NUM_USERS, NUM_ITEMS, DIM_USER_ATTR, DIM_ITEM_ATTR, mode);
    let model = CoupledCf::new(config, vb)?;
    Ok((model, varmap))
}

fn batch_inputs(n: usize) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let dev = Device::Cpu;
    let user_attr = Tensor::rand(0f32, 1f32, (n, DIM_USER_ATTR), &dev)?;
    let item_attr = Tensor::rand(0f32, 1f32, (n, DIM_ITEM_ATTR), &dev)?;
    let user_id = Tensor::from_vec((0..n as u32).map(|u| u % NUM_USERS as u32).collect(), n, &dev)?;
    let item_id = Tensor::from_vec((0..n as u32).map(|i| i % NUM_ITEMS as u32).collect(), n, &dev)?;
    Ok((user_attr, item_attr, user_id, item_id))
}

#[test]
fn every_mode_scores_into_open_unit_interval() -> Result<()> {
    for mode in [
        CouplingMode::Local,
        CouplingMode::Global,
        CouplingMode::Combined,
    ] {
        let (model, _vars) = build(mode)?;
        let (user_attr, item_attr, user_id, item_id) = batch_inputs(7)?;
        let scores = model.forward_t(
            &ScoreInputs {
                user_attr: &user_attr,
                item_attr: &item_attr,
                user_id: &user_id,
                item_id: &item_id,
            },
            false,
        )?;
        assert_eq!(scores.dims(), &[7]);
        for s in scores.to_vec1::<f32>()? {
            assert!(s > 0.0 && s < 1.0, "{:?} score {} outside (0,1)", mode, s);
        }
    }
    Ok(())
}

#[test]
fn attr_feature_widths_follow_the_mode() {
    let local = CoupledCfConfig::new(2, 2, 30, 18, CouplingMode::Local);
    let global = CoupledCfConfig::new(2, 2, 30, 18, CouplingMode::Global);
    let combined = CoupledCfConfig::new(2, 2, 30, 18, CouplingMode::Combined);

    // 8x8 map: two 3x3 convs leave 8 filters of 4x4
    assert_eq!(local.attr_feature_dim(), 128);
    assert_eq!(global.attr_feature_dim(), 64);
    assert_eq!(combined.attr_feature_dim(), 192);
}

#[test]
fn embedding_tables_reserve_one_padding_row() -> Result<()> {
    let (_model, varmap) = build(CouplingMode::Global)?;
    let data = varmap.data().lock().unwrap();
    let user_emb = data.get("user_emb.weight").unwrap();
    let item_emb = data.get("item_emb.weight").unwrap();
    assert_eq!(user_emb.dims(), &[NUM_USERS + 1, 32]);
    assert_eq!(item_emb.dims(), &[NUM_ITEMS + 1, 32]);
    Ok(())
}

#[test]
fn interaction_map_is_the_outer_product_of_latents() -> Result<()> {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

    // attribute width equals latent width so the projections can be
    // pinned to the identity
    let mut config = CoupledCfConfig::new(2, 2, 4, 4, CouplingMode::Global);
    config.dim_attr_latent = 4;
    let model = CoupledCf::new(config, vb)?;

    {
        let data = varmap.data().lock().unwrap();
        data.get("user_attr_proj.weight")
            .unwrap()
            .set(&Tensor::eye(4, DType::F32, &dev)?)?;
        data.get("item_attr_proj.weight")
            .unwrap()
            .set(&Tensor::eye(4, DType::F32, &dev)?)?;
        data.get("user_attr_proj.bias")
            .unwrap()
            .set(&Tensor::zeros(4, DType::F32, &dev)?)?;
        data.get("item_attr_proj.bias")
            .unwrap()
            .set(&Tensor::zeros(4, DType::F32, &dev)?)?;
    }

    let u = [0.5f32, 1.0, 0.0, 2.0];
    let v = [1.0f32, 0.25, 3.0, 0.0];
    let user_attr = Tensor::from_slice(&u, (1, 4), &dev)?;
    let item_attr = Tensor::from_slice(&v, (1, 4), &dev)?;

    let inter = model.attr_interaction(&user_attr, &item_attr)?;
    assert_eq!(inter.dims(), &[1, 4, 4]);

    let inter = inter.to_vec3::<f32>()?;
    for (i, &ui) in u.iter().enumerate() {
        for (j, &vj) in v.iter().enumerate() {
            assert_abs_diff_eq!(inter[0][i][j], ui * vj, epsilon = 1e-6);
        }
    }
    Ok(())
}

#[test]
fn global_features_match_the_flat_component_of_combined() -> Result<()> {
    let (combined, combined_vars) = build(CouplingMode::Combined)?;
    let (global, global_vars) = build(CouplingMode::Global)?;

    // share the attribute encoders between the two models
    {
        let src = combined_vars.data().lock().unwrap();
        let dst = global_vars.data().lock().unwrap();
        for name in [
            "user_attr_proj.weight",
            "user_attr_proj.bias",
            "item_attr_proj.weight",
            "item_attr_proj.bias",
        ] {
            dst.get(name)
                .unwrap()
                .set(src.get(name).unwrap().as_tensor())?;
        }
    }

    let (user_attr, item_attr, _uid, _iid) = batch_inputs(5)?;

    let global_flat = global.attr_features(&user_attr, &item_attr, false)?;
    let combined_cat = combined.attr_features(&user_attr, &item_attr, false)?;

    let conv_width = combined.config().conv_flat_dim();
    let flat_width = combined.config().global_flat_dim();
    assert_eq!(combined_cat.dims(), &[5, conv_width + flat_width]);

    let combined_flat = combined_cat.narrow(1, conv_width, flat_width)?;

    let a = global_flat.flatten_all()?.to_vec1::<f32>()?;
    let b = combined_flat.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn unknown_architecture_names_fail_fast() {
    assert!("local".parse::<CouplingMode>().is_ok());
    assert!("GLOBAL".parse::<CouplingMode>().is_ok());
    assert!("Combined".parse::<CouplingMode>().is_ok());
    assert!("resnet".parse::<CouplingMode>().is_err());
    assert!("".parse::<CouplingMode>().is_err());
}

#[test]
fn malformed_configurations_are_rejected() {
    let mut config = CoupledCfConfig::new(3, 4, 30, 18, CouplingMode::Local);
    assert!(config.validate().is_ok());

    // two 3x3 convolutions exhaust a 4x4 interaction map
    config.dim_attr_latent = 4;
    assert!(config.validate().is_err());

    // but the global variant never convolves
    config.mode = CouplingMode::Global;
    assert!(config.validate().is_ok());

    let zero_users = CoupledCfConfig::new(0, 4, 30, 18, CouplingMode::Global);
    assert!(zero_users.validate().is_err());
}

#[test]
fn summary_names_every_stage() -> Result<()> {
    let (model, _vars) = build(CouplingMode::Combined)?;
    let summary = model.summary();
    for needle in [
        "combined",
        "user_attr_proj",
        "item_attr_proj",
        "outer product",
        "attr_conv",
        "user_emb",
        "item_emb",
        "fusion",
        "sigmoid",
    ] {
        assert!(summary.contains(needle), "summary missing `{}`", needle);
    }
    Ok(())
}

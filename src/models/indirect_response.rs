//! One-compartment PK driving a turnover response with inhibited production:
//!
//! ```text
//! dR/dt = KIN * (1 - IMAX * C / (IC50 + C)) - KOUT * R,   KIN = BASE * KOUT
//! ```
//!
//! `R(0) = BASE`, so the response starts at its individual baseline.

use super::{ModelBuilder, ModelDefinition};
use crate::error::PKResult;

pub fn builder(absorption: bool) -> ModelBuilder {
    let central = absorption as usize;
    let response = central + 1;
    let mut b = ModelDefinition::builder(if absorption {
        "indirect_response_oral"
    } else {
        "indirect_response"
    });
    if absorption {
        b = b.compartment("depot");
    }
    b = b
        .compartment("central")
        .signed_compartment("response")
        .parameter("CL", 5.0)
        .parameter("V", 50.0)
        .parameter("KOUT", 0.1)
        .parameter("BASE", 100.0)
        .parameter("IMAX", 0.8)
        .parameter("IC50", 1.0);
    if absorption {
        b = b.parameter("KA", 1.2);
    }

    b.diffeq(move |_t, x, p, dx| {
        crate::fetch_params!(p, cl, v, kout, base, imax, ic50);
        if absorption {
            let ka = p[6];
            dx[0] = -ka * x[0];
            dx[central] = ka * x[0];
        }
        let c = x[central] / v;
        dx[central] -= cl * c;
        let inhibition = imax * c / (ic50 + c);
        dx[response] = base * kout * (1.0 - inhibition) - kout * x[response];
    })
    .init(move |p, x| {
        crate::fetch_params!(p, _cl, _v, _kout, base);
        x[response] = base;
    })
    .output("CP", move |x, p| x[central] / p[1])
    .signed_output("EFFECT", move |x, _p| x[response])
}

pub fn model(absorption: bool) -> PKResult<ModelDefinition> {
    builder(absorption).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dosing::DosingRegimen;
    use crate::simulation::engine::testing::predict;
    use approx::assert_relative_eq;

    #[test]
    fn test_response_stays_at_baseline_without_drug() {
        let model = model(false).unwrap();
        let effect = predict(&model, vec![], &[0.0, 10.0, 100.0], "EFFECT");
        for e in effect {
            assert_relative_eq!(e, 100.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_inhibition_lowers_response_then_recovers() {
        let model = model(false).unwrap();
        let times = [0.0, 12.0, 300.0];
        let effect = predict(&model, vec![DosingRegimen::bolus(500.0, 0)], &times, "EFFECT");
        assert_relative_eq!(effect[0], 100.0, epsilon = 1e-9);
        assert!(effect[1] < 90.0);
        assert_relative_eq!(effect[2], 100.0, max_relative = 1e-3);
    }

    #[test]
    fn test_constant_exposure_reaches_inhibited_steady_state() {
        // CL = 0 holds C = 1 = IC50, so R -> BASE * (1 - IMAX / 2).
        let model = builder(false).theta("CL", 0.0).build().unwrap();
        let effect = predict(&model, vec![DosingRegimen::bolus(50.0, 0)], &[400.0], "EFFECT");
        assert_relative_eq!(effect[0], 60.0, max_relative = 1e-6);
    }

    #[test]
    fn test_oral_variant_layout() {
        let model = model(true).unwrap();
        assert_eq!(model.compartment_index("response"), Some(2));
        assert_eq!(model.parameter_index("KA"), Some(6));
        assert!(!model.compartments()[2].nonnegative);
    }
}

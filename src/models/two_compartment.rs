//! Two-compartment mammillary model: `CL`, `V1`, `Q`, `V2`, plus `KA` when a
//! depot is present.

use super::{ModelBuilder, ModelDefinition};
use crate::error::PKResult;

pub fn builder(absorption: bool) -> ModelBuilder {
    let central = absorption as usize;
    let peripheral = central + 1;
    let mut b = ModelDefinition::builder(if absorption {
        "two_compartment_oral"
    } else {
        "two_compartment"
    });
    if absorption {
        b = b.compartment("depot");
    }
    b = b
        .compartment("central")
        .compartment("peripheral")
        .parameter("CL", 5.0)
        .parameter("V1", 50.0)
        .parameter("Q", 10.0)
        .parameter("V2", 100.0);
    if absorption {
        b = b.parameter("KA", 1.2);
    }

    b.diffeq(move |_t, x, p, dx| {
        crate::fetch_params!(p, cl, v1, q, v2);
        if absorption {
            let ka = p[4];
            dx[0] = -ka * x[0];
            dx[central] = ka * x[0];
        }
        let (k10, k12, k21) = (cl / v1, q / v1, q / v2);
        dx[central] += -(k10 + k12) * x[central] + k21 * x[peripheral];
        dx[peripheral] = k12 * x[central] - k21 * x[peripheral];
    })
    .output("CP", move |x, p| x[central] / p[1])
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

    /// Macro-rate constants `(alpha, beta, k21)` of the disposition.
    fn hybrid_constants(cl: f64, v1: f64, q: f64, v2: f64) -> (f64, f64, f64) {
        let k10 = cl / v1;
        let k12 = q / v1;
        let k21 = q / v2;
        let a = k10 + k12 + k21;
        let b = k10 * k21;
        let sqrt_disc = (a * a - 4.0 * b).sqrt();
        ((a + sqrt_disc) / 2.0, (a - sqrt_disc) / 2.0, k21)
    }

    fn with_params(absorption: bool) -> ModelDefinition {
        builder(absorption)
            .theta("CL", 2.0)
            .theta("V1", 10.0)
            .theta("Q", 1.0)
            .theta("V2", 5.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_two_compartment_iv_bolus() {
        let (alpha, beta, k21) = hybrid_constants(2.0, 10.0, 1.0, 5.0);
        let a = (alpha - k21) / (alpha - beta);
        let b = (k21 - beta) / (alpha - beta);
        let exact = |t: f64| 10.0 * (a * (-alpha * t).exp() + b * (-beta * t).exp());

        let times = [0.0, 1.0, 5.0, 24.0];
        let cp = predict(&with_params(false), vec![DosingRegimen::bolus(100.0, 0)], &times, "CP");
        for (c, t) in cp.iter().zip(times) {
            assert_relative_eq!(*c, exact(t), max_relative = 1e-6);
        }
        assert!(cp[1] > cp[2]);
    }

    #[test]
    fn test_two_compartment_oral() {
        let model = builder(true)
            .theta("CL", 2.0)
            .theta("V1", 10.0)
            .theta("Q", 1.0)
            .theta("V2", 5.0)
            .theta("KA", 1.5)
            .build()
            .unwrap();
        let ka: f64 = 1.5;
        let (alpha, beta, k21) = hybrid_constants(2.0, 10.0, 1.0, 5.0);
        let exact = |t: f64| {
            ka * 100.0 / 10.0
                * ((k21 - alpha) / ((ka - alpha) * (beta - alpha)) * (-alpha * t).exp()
                    + (k21 - beta) / ((ka - beta) * (alpha - beta)) * (-beta * t).exp()
                    + (k21 - ka) / ((alpha - ka) * (beta - ka)) * (-ka * t).exp())
        };

        let times = [0.5, 2.0, 12.0];
        let cp = predict(&model, vec![DosingRegimen::bolus(100.0, 0)], &times, "CP");
        for (c, t) in cp.iter().zip(times) {
            assert_relative_eq!(*c, exact(t), max_relative = 1e-5);
        }
    }

    #[test]
    fn test_distribution_without_elimination_conserves_mass() {
        let model = builder(false)
            .theta("CL", 0.0)
            .theta("V1", 10.0)
            .theta("Q", 3.0)
            .theta("V2", 30.0)
            .build()
            .unwrap();
        let cp = predict(&model, vec![DosingRegimen::bolus(100.0, 0)], &[200.0], "CP");
        // Equilibrium: equal concentrations in both spaces.
        assert_relative_eq!(cp[0], 100.0 / 40.0, max_relative = 1e-6);
    }
}

//! One-compartment disposition, optionally with a first-order absorption
//! depot. Parameters: `CL`, `V` and, with absorption, `KA`.

use super::{ModelBuilder, ModelDefinition};
use crate::error::PKResult;

pub const TV_CL: f64 = 5.0;
pub const TV_V: f64 = 50.0;
pub const TV_KA: f64 = 1.2;

pub fn builder(absorption: bool) -> ModelBuilder {
    let central = absorption as usize;
    let mut b = ModelDefinition::builder(if absorption {
        "one_compartment_oral"
    } else {
        "one_compartment"
    });
    if absorption {
        b = b.compartment("depot");
    }
    b = b
        .compartment("central")
        .parameter("CL", TV_CL)
        .parameter("V", TV_V);
    if absorption {
        b = b.parameter("KA", TV_KA);
    }

    b.diffeq(move |_t, x, p, dx| {
        crate::fetch_params!(p, cl, v);
        if absorption {
            let ka = p[2];
            dx[0] = -ka * x[0];
            dx[central] = ka * x[0];
        }
        dx[central] -= cl / v * x[central];
    })
    .output("CP", move |x, p| x[central] / p[1])
}

pub fn model(absorption: bool) -> PKResult<ModelDefinition> {
    builder(absorption).build()
}

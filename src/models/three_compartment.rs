//! Three-compartment mammillary model with a shallow and a deep peripheral
//! space: `CL`, `V1`, `Q2`, `V2`, `Q3`, `V3` (`KA` last with a depot).

use super::{ModelBuilder, ModelDefinition};
use crate::error::PKResult;

pub fn builder(absorption: bool) -> ModelBuilder {
    let central = absorption as usize;
    let (shallow, deep) = (central + 1, central + 2);
    let mut b = ModelDefinition::builder(if absorption {
        "three_compartment_oral"
    } else {
        "three_compartment"
    });
    if absorption {
        b = b.compartment("depot");
    }
    b = b
        .compartment("central")
        .compartment("peripheral")
        .compartment("peripheral2")
        .parameter("CL", 5.0)
        .parameter("V1", 50.0)
        .parameter("Q2", 10.0)
        .parameter("V2", 100.0)
        .parameter("Q3", 2.0)
        .parameter("V3", 200.0);
    if absorption {
        b = b.parameter("KA", 1.2);
    }

    b.diffeq(move |_t, x, p, dx| {
        crate::fetch_params!(p, cl, v1, q2, v2, q3, v3);
        if absorption {
            let ka = p[6];
            dx[0] = -ka * x[0];
            dx[central] = ka * x[0];
        }
        let c1 = x[central] / v1;
        let to_shallow = q2 * (c1 - x[shallow] / v2);
        let to_deep = q3 * (c1 - x[deep] / v3);
        dx[central] += -cl * c1 - to_shallow - to_deep;
        dx[shallow] = to_shallow;
        dx[deep] = to_deep;
    })
    .output("CP", move |x, p| x[central] / p[1])
}

pub fn model(absorption: bool) -> PKResult<ModelDefinition> {
    builder(absorption).build()
}

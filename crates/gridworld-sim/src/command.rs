//! Façade commands. Commands mutate state, so the worker must be stopped;
//! dispatch happens under the exclusive lock.

use rand::Rng;
use tracing::debug;

use gridworld_core::{EntityId, Pcg32, Registry};

use crate::SimError;

fn fresh_rng() -> Pcg32 {
    // Deliberately nondeterministic: normal ticks never pull OS entropy.
    let mut entropy = rand::rng();
    Pcg32::new(entropy.random(), entropy.random())
}

fn randomize_all(reg: &mut Registry) -> usize {
    let entities = reg.entities_with::<Pcg32>();
    for e in &entities {
        if let Ok(rng) = reg.get_mut::<Pcg32>(*e) {
            *rng = fresh_rng();
        }
    }
    reg.set_ctx(fresh_rng());
    entities.len()
}

fn randomize_one(reg: &mut Registry, raw: &str) -> Result<(), SimError> {
    let eid: u64 = raw
        .parse()
        .map_err(|_| SimError::InvalidArgument(format!("invalid entity id: {raw}")))?;
    let e = EntityId::from_raw(eid);
    let rng = reg.get_mut::<Pcg32>(e)?;
    *rng = fresh_rng();
    Ok(())
}

pub(crate) fn run(reg: &mut Registry, args: &[&str]) -> Result<String, SimError> {
    match args {
        ["randomize"] => {
            let count = randomize_all(reg);
            debug!(count, "re-seeded every RNG from entropy");
            Ok(format!("randomized {count} entity RNGs"))
        }
        ["randomize", raw] => {
            randomize_one(reg, raw)?;
            debug!(entity = raw, "re-seeded entity RNG from entropy");
            Ok(format!("randomized entity {raw}"))
        }
        [] => Err(SimError::InvalidArgument("empty command".to_owned())),
        [name, ..] => Err(SimError::InvalidArgument(format!(
            "unknown command: {name}"
        ))),
    }
}

use std::collections::BTreeMap;

use crate::chain::Checkpoint;

/// Combine the network's built-in checkpoints with user supplied ones.
/// A user entry replaces a built-in entry at the same height. The result is
/// ordered by height.
pub fn merge_checkpoints(default: &[Checkpoint], additional: &[Checkpoint]) -> Vec<Checkpoint> {
    let mut by_height: BTreeMap<i32, Checkpoint> =
        default.iter().map(|c| (c.height, *c)).collect();
    for checkpoint in additional {
        by_height.insert(checkpoint.height, *checkpoint);
    }
    by_height.into_values().collect()
}

/// Parse `height:hash` checkpoint strings from the configuration.
pub fn parse_checkpoints(entries: &[String]) -> Result<Vec<Checkpoint>, String> {
    entries
        .iter()
        .map(|entry| {
            let (height, hash) = entry
                .split_once(':')
                .ok_or_else(|| format!("unable to parse checkpoint {:?} -- use the syntax <height>:<hash>", entry))?;
            let height = height
                .parse::<i32>()
                .map_err(|_| format!("unable to parse checkpoint {:?} due to malformed height", entry))?;
            let hash = hash
                .parse()
                .map_err(|_| format!("unable to parse checkpoint {:?} due to malformed hash", entry))?;
            Ok(Checkpoint { height, hash })
        })
        .collect()
}

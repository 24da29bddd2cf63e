//! Object-reference resolution
//!
//! Turns a signal address such as `IED1::LD0/CSWI1.Pos.Oper.ctlVal` into the
//! bare data-object reference (`LD0/CSWI1.Pos`) the control API expects.

/// Separator between the synthetic device name and the device-local path
pub const DEVICE_SEPARATOR: &str = "::";

/// Control-related suffixes, longest first; at most one is stripped
const CONTROL_SUFFIXES: &[&str] = &[".Oper.ctlVal", ".Oper", ".SBOw", ".SBO", ".stVal", ".ctlVal"];

/// Resolve an address to its control-object reference
///
/// Returns `None` for empty input. Input without a recognizable `LD/LN`
/// structure comes back unmodified apart from prefix removal.
pub fn resolve_control_object(address: &str) -> Option<String> {
    let path = strip_device_prefix(address).trim();
    if path.is_empty() {
        return None;
    }

    if !path.contains('/') {
        return Some(path.to_string());
    }

    let bare = CONTROL_SUFFIXES
        .iter()
        .find_map(|suffix| path.strip_suffix(suffix))
        .unwrap_or(path);

    if bare.is_empty() {
        return None;
    }
    Some(collapse_duplicate_ld(bare))
}

/// Drop everything up to and including the first `::`
pub fn strip_device_prefix(address: &str) -> &str {
    match address.find(DEVICE_SEPARATOR) {
        Some(pos) => &address[pos + DEVICE_SEPARATOR.len()..],
        None => address,
    }
}

/// Split `Device::path` into its parts
pub fn split_device_address(address: &str) -> Option<(&str, &str)> {
    let pos = address.find(DEVICE_SEPARATOR)?;
    let device = &address[..pos];
    let path = &address[pos + DEVICE_SEPARATOR.len()..];
    if device.is_empty() || path.is_empty() {
        return None;
    }
    Some((device, path))
}

/// Join a device name and a device-local path
pub fn device_address(device: &str, path: &str) -> String {
    format!("{device}{DEVICE_SEPARATOR}{path}")
}

/// Collapse a doubled leading logical-device segment (`LD0/LD0/LLN0...`)
pub fn collapse_duplicate_ld(path: &str) -> String {
    let mut rest = path;
    loop {
        let Some((first, tail)) = rest.split_once('/') else {
            break;
        };
        let Some((second, _)) = tail.split_once('/') else {
            break;
        };
        if first.is_empty() || first != second {
            break;
        }
        rest = tail;
    }
    rest.to_string()
}

/// Build `LD/LN`, tolerating logical-node names that already carry the LD
pub fn logical_node_ref(logical_device: &str, logical_node: &str) -> String {
    let ln = logical_node
        .strip_prefix(logical_device)
        .and_then(|r| r.strip_prefix('/'))
        .unwrap_or(logical_node);
    collapse_duplicate_ld(&format!("{logical_device}/{ln}"))
}

/// Build `LD/LN.DO`, tolerating data-object names that carry the LN path
pub fn data_object_ref(logical_node_ref: &str, data_object: &str) -> String {
    let name = data_object
        .strip_prefix(logical_node_ref)
        .and_then(|r| r.strip_prefix('.'))
        .unwrap_or(data_object);
    format!("{logical_node_ref}.{name}")
}

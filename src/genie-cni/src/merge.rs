//! Result merging
//!
//! Folds the results of several backends into one attachment result. Each
//! incoming result is repaired first, then its interfaces are appended after
//! the ones already collected and its IP assignments are re-based so they
//! keep pointing at their own interface.

use tracing::debug;

use crate::error::GenieError;
use crate::result::CniResult;

/// Backfill route gateways that a backend left unset
///
/// Unset gateways take the first gateway among the result's own IPs.
pub fn backfill_gateways(backend: &str, result: &mut CniResult) -> Result<(), GenieError> {
    if result.routes.is_empty() {
        return Ok(());
    }

    let gateway = result.ips.iter().find_map(|ip| ip.gateway.clone());

    for route in result.routes.iter_mut().filter(|r| r.gw.is_none()) {
        let gw = gateway.clone().ok_or_else(|| {
            GenieError::inconsistent(
                backend,
                format!("route to {} has no gateway and no IP carries one", route.dst),
            )
        })?;
        route.gw = Some(gw);
    }

    Ok(())
}

/// Drop interface indices that point into an empty interface list
///
/// Some backends (calico among them) report their addresses against
/// interface 0 without reporting any interface.
pub fn repair_interface_indices(result: &mut CniResult) {
    if !result.interfaces.is_empty() {
        return;
    }

    for ip in result.ips.iter_mut().filter(|ip| ip.interface == Some(0)) {
        debug!(address = %ip.address, "clearing interface index of IP with no reported interface");
        ip.interface = None;
    }
}

/// Repair a backend's result so it can be merged
pub fn repair(backend: &str, mut result: CniResult) -> Result<CniResult, GenieError> {
    backfill_gateways(backend, &mut result)?;
    repair_interface_indices(&mut result);
    Ok(result)
}

/// Merge a repaired result into the accumulator
///
/// The first result becomes the accumulator as is. Later results are
/// appended in order; DNS lists are concatenated without de-duplication.
pub fn merge(acc: Option<CniResult>, src: CniResult) -> CniResult {
    let Some(mut dst) = acc else {
        return src;
    };

    let offset = dst.interfaces.len();

    dst.interfaces.extend(src.interfaces);
    dst.ips.extend(src.ips.into_iter().map(|mut ip| {
        ip.interface = ip.interface.map(|i| i + offset);
        ip
    }));
    dst.routes.extend(src.routes);

    dst.dns.nameservers.extend(src.dns.nameservers);
    dst.dns.search.extend(src.dns.search);
    dst.dns.options.extend(src.dns.options);
    if dst.dns.domain.is_none() {
        dst.dns.domain = src.dns.domain;
    }

    dst
}

/// Repair `src` and merge it into the accumulator
pub fn merge_result(
    backend: &str,
    acc: Option<CniResult>,
    src: CniResult,
) -> Result<CniResult, GenieError> {
    let src = repair(backend, src)?;
    Ok(merge(acc, src))
}

use crate::error::RingError;
use crate::net::wire::ring::AddressMsg;
use crate::ring::id::{Address, KeySpace};

pub fn address_to_msg(addr: &Address) -> AddressMsg {
    AddressMsg {
        id: addr.id().raw(),
        host: addr.host().to_string(),
        port: u32::from(addr.port()),
    }
}

/// Rebuilds an [`Address`] from the wire, validating the identifier against
/// the local ring width. A peer configured with a different width shows up
/// here, not deep inside the routing logic.
pub fn address_from_msg(space: &KeySpace, msg: &AddressMsg) -> Result<Address, RingError> {
    let port = u16::try_from(msg.port).map_err(|_| {
        RingError::InvalidIdentifier(format!("malformed wire address: port {}", msg.port))
    })?;
    Address::from_parts(space, msg.id, msg.host.clone(), port)
}

pub fn required_address(
    space: &KeySpace,
    msg: Option<AddressMsg>,
) -> Result<Address, RingError> {
    let msg = msg.ok_or_else(|| {
        RingError::InvalidIdentifier("peer response is missing an address".into())
    })?;
    address_from_msg(space, &msg)
}

pub fn optional_address(
    space: &KeySpace,
    msg: Option<AddressMsg>,
) -> Result<Option<Address>, RingError> {
    msg.map(|m| address_from_msg(space, &m)).transpose()
}

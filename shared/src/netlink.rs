use crate::RouteEntry;
use ipnet::IpNet;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_REPLACE,
    NLM_F_REQUEST,
};
use netlink_packet_route::{
    address::{AddressAttribute, AddressMessage, AddressScope},
    link::{LinkAttribute, LinkFlags, LinkMessage},
    route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol, RouteScope,
        RouteType,
    },
    AddressFamily, RouteNetlinkMessage,
};
use netlink_request::netlink_request;
use netlink_sys::protocols::NETLINK_ROUTE;
use std::{io, net::IpAddr};
use wireguard_control::InterfaceName;

fn netlink_call(
    message: RouteNetlinkMessage,
    flags: Option<u16>,
) -> Result<Vec<NetlinkMessage<RouteNetlinkMessage>>, io::Error> {
    netlink_request(message, flags, NETLINK_ROUTE)
}

fn if_nametoindex(interface: &InterfaceName) -> Result<u32, io::Error> {
    match unsafe { libc::if_nametoindex(interface.as_ptr()) } {
        0 => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("couldn't find interface '{interface}'."),
        )),
        index => Ok(index),
    }
}

pub fn set_up(interface: &InterfaceName, mtu: u32) -> Result<(), io::Error> {
    let index = if_nametoindex(interface)?;
    let mut message = LinkMessage::default();
    message.header.index = index;
    message.header.flags = LinkFlags::Up;
    message.header.change_mask = LinkFlags::Up;
    message.attributes.push(LinkAttribute::Mtu(mtu));
    netlink_call(RouteNetlinkMessage::SetLink(message), None)?;
    log::debug!("set interface {} up with mtu {}", interface, mtu);
    Ok(())
}

pub fn set_addr(interface: &InterfaceName, addr: IpNet) -> Result<(), io::Error> {
    let index = if_nametoindex(interface)?;
    let (family, attributes) = match addr {
        IpNet::V4(network) => {
            let addr = IpAddr::V4(network.addr());
            (
                AddressFamily::Inet,
                vec![
                    AddressAttribute::Local(addr),
                    AddressAttribute::Address(addr),
                ],
            )
        },
        IpNet::V6(network) => (
            AddressFamily::Inet6,
            vec![AddressAttribute::Address(IpAddr::V6(network.addr()))],
        ),
    };
    let mut message = AddressMessage::default();
    message.header.index = index;
    message.header.family = family;
    message.header.prefix_len = addr.prefix_len();
    message.header.scope = AddressScope::Universe;
    message.attributes = attributes;
    netlink_call(
        RouteNetlinkMessage::NewAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK | NLM_F_REPLACE | NLM_F_CREATE),
    )?;
    log::debug!("set address {} on interface {}", addr, interface);
    Ok(())
}

pub fn del_addr(interface: &InterfaceName, addr: IpNet) -> Result<(), io::Error> {
    let index = if_nametoindex(interface)?;
    let (family, attributes) = match addr {
        IpNet::V4(network) => (
            AddressFamily::Inet,
            vec![AddressAttribute::Local(IpAddr::V4(network.addr()))],
        ),
        IpNet::V6(network) => (
            AddressFamily::Inet6,
            vec![AddressAttribute::Address(IpAddr::V6(network.addr()))],
        ),
    };
    let mut message = AddressMessage::default();
    message.header.index = index;
    message.header.family = family;
    message.header.prefix_len = addr.prefix_len();
    message.attributes = attributes;
    netlink_call(
        RouteNetlinkMessage::DelAddress(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    log::debug!("removed address {} from interface {}", addr, interface);
    Ok(())
}

fn route_message(interface_index: u32, cidr: IpNet) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.table = RouteHeader::RT_TABLE_MAIN;
    message.header.protocol = RouteProtocol::Boot;
    message.header.scope = RouteScope::Link;
    message.header.kind = RouteType::Unicast;
    message.header.destination_prefix_length = cidr.prefix_len();
    match cidr {
        IpNet::V4(network) => {
            message.header.address_family = AddressFamily::Inet;
            message
                .attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet(
                    network.network(),
                )));
        },
        IpNet::V6(network) => {
            message.header.address_family = AddressFamily::Inet6;
            message
                .attributes
                .push(RouteAttribute::Destination(RouteAddress::Inet6(
                    network.network(),
                )));
        },
    }
    message.attributes.push(RouteAttribute::Oif(interface_index));
    message
}

/// Add a directly-connected route through the interface. Returns `true` if
/// the route was added, `false` if it already existed.
pub fn add_route(interface: &InterfaceName, cidr: IpNet) -> Result<bool, io::Error> {
    let index = if_nametoindex(interface)?;
    let message = route_message(index, cidr);
    match netlink_call(RouteNetlinkMessage::NewRoute(message), None) {
        Ok(_) => {
            log::debug!("added route {} via interface {}", cidr, interface);
            Ok(true)
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Add a managed route through a gateway on the interface (relay and
/// advertised-network routes). Returns `true` if the route was added.
pub fn add_route_via(
    interface: &InterfaceName,
    cidr: IpNet,
    gateway: IpAddr,
) -> Result<bool, io::Error> {
    let index = if_nametoindex(interface)?;
    let mut message = route_message(index, cidr);
    message.header.scope = RouteScope::Universe;
    let via = match gateway {
        IpAddr::V4(addr) => RouteAddress::Inet(addr),
        IpAddr::V6(addr) => RouteAddress::Inet6(addr),
    };
    message.attributes.push(RouteAttribute::Gateway(via));
    match netlink_call(RouteNetlinkMessage::NewRoute(message), None) {
        Ok(_) => {
            log::debug!("added route {} via {} on {}", cidr, gateway, interface);
            Ok(true)
        },
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn del_route(interface: &InterfaceName, route: &RouteEntry) -> Result<(), io::Error> {
    let index = if_nametoindex(interface)?;
    let mut message = route_message(index, route.cidr);
    if let Some(gateway) = route.gateway {
        message.header.scope = RouteScope::Universe;
        let gateway = match gateway {
            IpAddr::V4(addr) => RouteAddress::Inet(addr),
            IpAddr::V6(addr) => RouteAddress::Inet6(addr),
        };
        message.attributes.push(RouteAttribute::Gateway(gateway));
    }
    netlink_call(
        RouteNetlinkMessage::DelRoute(message),
        Some(NLM_F_REQUEST | NLM_F_ACK),
    )?;
    log::debug!("removed route {} from interface {}", route.cidr, interface);
    Ok(())
}

fn route_entry(index: u32, message: &RouteMessage) -> Option<RouteEntry> {
    if message.header.table != RouteHeader::RT_TABLE_MAIN {
        return None;
    }
    let mut oif = None;
    let mut destination = None;
    let mut gateway = None;
    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Oif(interface_index) => oif = Some(*interface_index),
            RouteAttribute::Destination(address) => destination = route_address(address),
            RouteAttribute::Gateway(address) => gateway = route_address(address),
            _ => {},
        }
    }
    if oif != Some(index) {
        return None;
    }
    let destination = destination?;
    let cidr = IpNet::new(destination, message.header.destination_prefix_length).ok()?;
    Some(RouteEntry { cidr, gateway })
}

fn route_address(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

/// All routes in the main table that go through this interface.
pub fn list_routes(interface: &InterfaceName) -> Result<Vec<RouteEntry>, io::Error> {
    let index = if_nametoindex(interface)?;
    let responses = netlink_call(
        RouteNetlinkMessage::GetRoute(RouteMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    Ok(responses
        .into_iter()
        .filter_map(|response| {
            if let NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(message)),
                ..
            } = response
            {
                route_entry(index, &message)
            } else {
                None
            }
        })
        .collect())
}

pub fn get_local_addrs() -> Result<impl Iterator<Item = IpAddr>, io::Error> {
    let link_responses = netlink_call(
        RouteNetlinkMessage::GetLink(LinkMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    let links = link_responses
        .into_iter()
        .filter_map(|response| {
            if let NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)),
                ..
            } = response
            {
                Some(link)
            } else {
                None
            }
        })
        // Only select interfaces that are up and running.
        .filter(|link| {
            link.header.flags.contains(LinkFlags::Up)
                && link.header.flags.contains(LinkFlags::LowerUp)
        })
        .map(|link| link.header.index)
        .collect::<Vec<_>>();

    let addr_responses = netlink_call(
        RouteNetlinkMessage::GetAddress(AddressMessage::default()),
        Some(NLM_F_DUMP | NLM_F_REQUEST),
    )?;
    Ok(addr_responses
        .into_iter()
        .filter_map(|response| {
            if let NetlinkMessage {
                payload: NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewAddress(addr)),
                ..
            } = response
            {
                Some(addr)
            } else {
                None
            }
        })
        .filter(move |addr| links.contains(&addr.header.index))
        .filter(|addr| addr.header.scope == AddressScope::Universe)
        .filter_map(|addr| {
            addr.attributes.iter().find_map(|attribute| match attribute {
                AddressAttribute::Address(address) => Some(*address),
                _ => None,
            })
        }))
}

//! About announcements.

use crate::context::BusContext;
use crate::error::BusResult;
use crate::propstore::ReadFilter;
use crate::wire::signature as sig;
use crate::wire::{flags, ids, BodyWriter, BusTransport, MsgType, WireMessage};

/// Object path of the About object
pub const ABOUT_PATH: &str = "/About";

/// About interface name
pub const ABOUT_IFACE: &str = "org.alljoyn.About";

/// About protocol version
pub const ABOUT_VERSION: u16 = 1;

const ANNOUNCE_SIGNATURE: &str = "qqa(oas)a{sv}";

/// Publishes the application's About data
pub trait Announcer: Send {
    /// The application session port was bound
    fn port_bound(&mut self);

    /// Called once per loop iteration before receiving
    fn service(&mut self, ctx: &mut BusContext, transport: &mut dyn BusTransport) -> BusResult<()>;
}

/// Sends a sessionless `Announce` once the app port is bound and again
/// whenever an announced property changes
#[derive(Debug, Default)]
pub struct AboutAnnouncer {
    bound: bool,
    pending: bool,
    sent: u32,
}

impl AboutAnnouncer {
    /// Create an announcer waiting for the port to be bound
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of announcements sent
    pub fn announcements(&self) -> u32 {
        self.sent
    }
}

impl Announcer for AboutAnnouncer {
    fn port_bound(&mut self) {
        self.bound = true;
        self.pending = true;
    }

    fn service(&mut self, ctx: &mut BusContext, transport: &mut dyn BusTransport) -> BusResult<()> {
        if !self.bound || !ctx.is_attached() {
            return Ok(());
        }
        let changed = ctx.properties.take_changed();
        if !(self.pending || changed) {
            return Ok(());
        }
        let msg = announce_message(ctx)?;
        ctx.deliver(transport, msg)?;
        self.pending = false;
        self.sent += 1;
        tracing::info!(count = self.sent, "Sent About announcement");
        Ok(())
    }
}

/// Build the `Announce` signal for the local objects and About fields
pub fn announce_message(ctx: &BusContext) -> BusResult<WireMessage> {
    let mut writer = BodyWriter::new(ANNOUNCE_SIGNATURE);
    writer.put_u16(ABOUT_VERSION)?;
    writer.put_u16(ctx.config.app_port)?;

    writer.open_container(sig::ARRAY)?;
    let interfaces = ctx.objects.interfaces();
    for obj in ctx.objects.objects() {
        writer.open_container(sig::STRUCT_OPEN)?;
        writer.put_string(sig::OBJECT_PATH, &obj.path)?;
        writer.open_container(sig::ARRAY)?;
        // index 0 is the properties interface, which is never announced
        for &idx in obj.interfaces.iter().skip(1) {
            if let Some(iface) = interfaces.get(idx) {
                writer.put_string(sig::STRING, &iface.name)?;
            }
        }
        writer.close_container()?;
        writer.close_container()?;
    }
    writer.close_container()?;

    writer.open_container(sig::ARRAY)?;
    for (name, value) in ctx.properties.read_all(ReadFilter::Announce) {
        writer.open_container(sig::DICT_OPEN)?;
        writer.put_string(sig::STRING, name)?;
        match (name, hex::decode(value)) {
            ("AppId", Ok(bytes)) => {
                writer.open_variant("ay")?;
                writer.put_byte_array(&bytes)?;
            }
            _ => {
                writer.open_variant("s")?;
                writer.put_string(sig::STRING, value)?;
            }
        }
        writer.close_container()?;
    }
    writer.close_container()?;

    let mut msg = WireMessage::new(MsgType::Signal, ids::SIGNAL_ABOUT_ANNOUNCE)
        .with_member(ABOUT_PATH, ABOUT_IFACE, "Announce")
        .with_flags(flags::SESSIONLESS)
        .with_body(ANNOUNCE_SIGNATURE, writer.finish()?);
    msg.ttl = ctx.config.sessionless_ttl_secs as u32;
    Ok(msg)
}

use ferry_common::{CommandId, Reply, Site};
use ferry_core::operation::{OpMeta, Operation};

use super::op_meta;
use crate::session::{HttpContext, HttpSession};

/// HTTP keeps no session: connecting only records the site. Connections
/// are opened by the requests themselves.
pub struct ConnectOp {
    meta: OpMeta,
    site: Site,
}

impl ConnectOp {
    pub fn new(site: Site) -> Self {
        Self {
            meta: OpMeta::new("ConnectOp", CommandId::Connect),
            site,
        }
    }
}

impl Operation<HttpSession> for ConnectOp {
    op_meta!();

    fn send(&mut self, session: &mut HttpSession, cx: &mut HttpContext) -> Reply {
        if !matches!(
            self.site.server.protocol,
            ferry_common::Protocol::Http | ferry_common::Protocol::Https
        ) {
            cx.log.error(format!(
                "{} is not an HTTP server",
                self.site.server
            ));
            return Reply::CRITICAL_ERROR;
        }
        session.connected = true;
        cx.log.status(format!("Ready to talk to {}", self.site.server));
        Reply::OK
    }
}

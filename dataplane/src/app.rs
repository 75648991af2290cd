/*
Copyright 2023 The Virga Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

//! Application-helper registry, keyed by virtual port.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use common::ConnFlags;

use crate::conn::Conn;
use crate::error::DataplaneError;
use crate::framework::AppHelper;

const APP_TAB_BITS: u16 = 4;
const APP_TAB_SIZE: usize = 1 << APP_TAB_BITS;
const APP_TAB_MASK: usize = APP_TAB_SIZE - 1;

fn app_hashkey(port: u16) -> usize {
    ((port >> APP_TAB_BITS) ^ port) as usize & APP_TAB_MASK
}

/// Fixed-size hash table of helpers; one mutex guards registration,
/// unregistration and bind lookups.
#[derive(Default)]
pub(crate) struct AppRegistry {
    tab: Mutex<[Vec<Arc<dyn AppHelper>>; APP_TAB_SIZE]>,
}

impl AppRegistry {
    pub(crate) fn register(&self, helper: Arc<dyn AppHelper>) -> Result<(), DataplaneError> {
        let port = helper.port();
        let mut tab = self.tab.lock();
        let bucket = &mut tab[app_hashkey(port)];
        if bucket.iter().any(|existing| existing.port() == port) {
            return Err(DataplaneError::AppExists(port));
        }
        debug!("tcp: registered app helper {} on port {}", helper.name(), port);
        bucket.push(helper);
        Ok(())
    }

    pub(crate) fn unregister(&self, port: u16) {
        let mut tab = self.tab.lock();
        tab[app_hashkey(port)].retain(|helper| helper.port() != port);
    }

    fn lookup(&self, port: u16) -> Option<Arc<dyn AppHelper>> {
        let tab = self.tab.lock();
        tab[app_hashkey(port)]
            .iter()
            .find(|helper| helper.port() == port)
            .cloned()
    }

    /// Bind a helper to a fresh connection. Only classic-NAT connections
    /// bind; full-NAT and direct-return traffic never sees a helper.
    pub(crate) fn conn_bind(&self, conn: &Conn) {
        if !conn.test_flag(ConnFlags::MASQ) || conn.app().is_some() {
            return;
        }
        if let Some(helper) = self.lookup(conn.vport()) {
            debug!(
                "tcp: bound {} to connection on vport {}",
                helper.name(),
                conn.vport()
            );
            helper.init(conn);
            conn.bind_app(helper);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AddressFamily;
    use std::net::{IpAddr, Ipv4Addr};

    struct FtpHelper {
        port: u16,
    }

    impl AppHelper for FtpHelper {
        fn port(&self) -> u16 {
            self.port
        }

        fn name(&self) -> &str {
            "ftp"
        }
    }

    fn conn(flags: ConnFlags) -> Conn {
        Conn::new(
            AddressFamily::Inet,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            5000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 100)),
            21,
            IpAddr::V4(Ipv4Addr::new(10, 1, 0, 5)),
            21,
            flags,
            None,
        )
    }

    #[test]
    fn duplicate_port_registration_fails() {
        let reg = AppRegistry::default();
        reg.register(Arc::new(FtpHelper { port: 21 })).unwrap();
        assert!(matches!(
            reg.register(Arc::new(FtpHelper { port: 21 })),
            Err(DataplaneError::AppExists(21))
        ));
        // a different port is fine even if it lands in the same bucket
        reg.register(Arc::new(FtpHelper { port: 2121 })).unwrap();
    }

    #[test]
    fn bind_is_nat_only() {
        let reg = AppRegistry::default();
        reg.register(Arc::new(FtpHelper { port: 21 })).unwrap();

        let masq = conn(ConnFlags::MASQ);
        reg.conn_bind(&masq);
        assert!(masq.app().is_some());

        let fnat = conn(ConnFlags::FULLNAT);
        reg.conn_bind(&fnat);
        assert!(fnat.app().is_none());
    }

    #[test]
    fn unregister_removes_binding_target() {
        let reg = AppRegistry::default();
        reg.register(Arc::new(FtpHelper { port: 21 })).unwrap();
        reg.unregister(21);
        let c = conn(ConnFlags::MASQ);
        reg.conn_bind(&c);
        assert!(c.app().is_none());
    }
}

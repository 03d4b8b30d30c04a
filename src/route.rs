//! Route table facade.
//!
//! Routes arrive from the control plane fully decoded; the table resolves
//! them by `(route id, authorization, predicate)` in registration order,
//! the way the host's route manager does.

/// Which side of the TLS exchange this route terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Decrypt inbound network streams toward an application target.
    Server,
    /// Encrypt application streams toward a remote network target.
    Client,
}

/// TLS route extension: which store context to use and the SNI/ALPN
/// constraints this route matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsRouteEx {
    pub store: Option<String>,
    pub hostname: Option<String>,
    pub application_protocol: Option<String>,
}

/// One registered route.
#[derive(Debug, Clone)]
pub struct Route {
    pub route_id: u64,
    pub kind: RouteKind,
    pub local_address: String,
    pub remote_address: String,
    pub extension: TlsRouteEx,
}

/// Registration-ordered route table.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// `route_id` must be unique within the module.
    pub fn insert(&mut self, route: Route) -> bool {
        if self.routes.iter().any(|r| r.route_id == route.route_id) {
            return false;
        }
        self.routes.push(route);
        true
    }

    pub fn remove(&mut self, route_id: u64) -> Option<Route> {
        let pos = self.routes.iter().position(|r| r.route_id == route_id)?;
        Some(self.routes.remove(pos))
    }

    pub fn get(&self, route_id: u64) -> Option<&Route> {
        self.routes.iter().find(|r| r.route_id == route_id)
    }

    /// First route of `kind` satisfying `predicate`, in registration
    /// order.  The authorization value is carried for parity with the
    /// host's resolver; this module applies no authorization filtering
    /// itself.
    pub fn resolve(
        &self,
        kind: RouteKind,
        _authorization: u64,
        predicate: impl Fn(&Route) -> bool,
    ) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.kind == kind && predicate(r))
    }
}

/// Route predicate for TLS handshake completion: the route matches when
/// each constraint it carries equals the negotiated value.
pub(crate) fn matches_session(
    route: &Route,
    hostname: Option<&str>,
    application_protocol: Option<&str>,
) -> bool {
    let ex = &route.extension;
    (ex.hostname.is_none() || ex.hostname.as_deref() == hostname)
        && (ex.application_protocol.is_none()
            || ex.application_protocol.as_deref() == application_protocol)
}

/// Route predicate for ALPN selection: the route's protocol (if any) must
/// be among the protocols the client offered.
pub(crate) fn matches_client_hello(
    route: &Route,
    hostname: Option<&str>,
    offered: &[String],
) -> bool {
    let ex = &route.extension;
    (ex.hostname.is_none() || ex.hostname.as_deref() == hostname)
        && match ex.application_protocol.as_deref() {
            None => true,
            Some(p) => offered.iter().any(|o| o == p),
        }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: u64, hostname: Option<&str>, protocol: Option<&str>) -> Route {
        Route {
            route_id: id,
            kind: RouteKind::Server,
            local_address: "net#0".into(),
            remote_address: "app#0".into(),
            extension: TlsRouteEx {
                store: None,
                hostname: hostname.map(String::from),
                application_protocol: protocol.map(String::from),
            },
        }
    }

    #[test]
    fn duplicate_route_id_rejected() {
        let mut table = RouteTable::new();
        assert!(table.insert(route(7, None, None)));
        assert!(!table.insert(route(7, Some("x"), None)));
    }

    #[test]
    fn resolve_in_registration_order() {
        let mut table = RouteTable::new();
        table.insert(route(1, Some("a.example"), None));
        table.insert(route(2, None, None));

        let hit = table
            .resolve(RouteKind::Server, 0, |r| {
                matches_session(r, Some("b.example"), None)
            })
            .unwrap();
        assert_eq!(hit.route_id, 2);

        let hit = table
            .resolve(RouteKind::Server, 0, |r| {
                matches_session(r, Some("a.example"), None)
            })
            .unwrap();
        assert_eq!(hit.route_id, 1);
    }

    #[test]
    fn session_predicate_requires_protocol_equality() {
        let r = route(1, None, Some("http/1.1"));
        assert!(matches_session(&r, None, Some("http/1.1")));
        assert!(!matches_session(&r, None, Some("h2")));
        assert!(!matches_session(&r, None, None));
    }

    #[test]
    fn hello_predicate_checks_offered_list() {
        let r = route(1, Some("a.example"), Some("h2"));
        let offered = vec!["http/1.1".to_string(), "h2".to_string()];
        assert!(matches_client_hello(&r, Some("a.example"), &offered));
        assert!(!matches_client_hello(&r, Some("a.example"), &["http/1.1".to_string()]));
        assert!(!matches_client_hello(&r, Some("b.example"), &offered));
    }

    #[test]
    fn unconstrained_route_matches_anything() {
        let r = route(1, None, None);
        assert!(matches_session(&r, Some("whatever"), Some("h2")));
        assert!(matches_session(&r, None, None));
        assert!(matches_client_hello(&r, None, &[]));
    }
}

//! Connection strategy decision

use pierce_nat::{NatClass, Strategy};
use pierce_signal::PeerRecord;

/// Pick the strategy two peers should attempt
///
/// Rules, first match wins:
/// 1. Same LAN (one side's reflected address is the other's local address): Direct
/// 2. Either side has no NAT or a full-cone NAT: Direct, that side accepts
/// 3. Both sides symmetric: Relay
/// 4. Otherwise: HolePunch, with Relay as the fallback
#[must_use]
pub fn determine_strategy(a: &PeerRecord, b: &PeerRecord) -> Strategy {
    if a.shares_lan_with(b) {
        return Strategy::Direct;
    }
    let reachable = |class: NatClass| matches!(class, NatClass::None | NatClass::FullCone);
    if reachable(a.nat_class) || reachable(b.nat_class) {
        return Strategy::Direct;
    }
    if a.nat_class == NatClass::Symmetric && b.nat_class == NatClass::Symmetric {
        return Strategy::Relay;
    }
    Strategy::HolePunch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str, class: NatClass) -> PeerRecord {
        PeerRecord {
            nat_class: class,
            ..PeerRecord::new(id)
        }
    }

    #[test]
    fn test_public_peer_gets_direct() {
        let a = peer("a", NatClass::Symmetric);
        let b = peer("b", NatClass::None);
        assert_eq!(determine_strategy(&a, &b), Strategy::Direct);
    }

    #[test]
    fn test_full_cone_peer_gets_direct() {
        let a = peer("a", NatClass::RestrictedCone);
        let b = peer("b", NatClass::FullCone);
        assert_eq!(determine_strategy(&a, &b), Strategy::Direct);
    }

    #[test]
    fn test_restricted_pair_hole_punches() {
        let a = peer("a", NatClass::RestrictedCone);
        let b = peer("b", NatClass::PortRestrictedCone);
        assert_eq!(determine_strategy(&a, &b), Strategy::HolePunch);
    }

    #[test]
    fn test_symmetric_pair_relays() {
        let a = peer("a", NatClass::Symmetric);
        let b = peer("b", NatClass::Symmetric);
        assert_eq!(determine_strategy(&a, &b), Strategy::Relay);

        let c = peer("c", NatClass::PortRestrictedCone);
        assert_eq!(determine_strategy(&a, &c), Strategy::HolePunch);
    }

    #[test]
    fn test_same_lan_wins_over_symmetric() {
        let a = PeerRecord {
            external_addr: Some("203.0.113.9:4000".parse().unwrap()),
            local_addr: Some("192.168.1.20:4000".parse().unwrap()),
            ..peer("a", NatClass::Symmetric)
        };
        let b = PeerRecord {
            external_addr: Some("192.168.1.20:4000".parse().unwrap()),
            local_addr: Some("192.168.1.21:4000".parse().unwrap()),
            ..peer("b", NatClass::Symmetric)
        };
        assert_eq!(determine_strategy(&a, &b), Strategy::Direct);
    }

    #[test]
    fn test_unknown_pair_hole_punches() {
        let a = peer("a", NatClass::Unknown);
        let b = peer("b", NatClass::Unknown);
        assert_eq!(determine_strategy(&a, &b), Strategy::HolePunch);
    }
}

//! QP states and the transition legality table.

use super::attr::QpAttrMask as M;

/// QP states visible to verbs consumers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum QpState {
    #[default]
    Reset,
    Init,
    Rtr,
    Rts,
    Sqd,
    Sqe,
    Err,
}

impl QpState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            QpState::Reset => 0,
            QpState::Init => 1,
            QpState::Rtr => 2,
            QpState::Rts => 3,
            QpState::Sqd => 4,
            QpState::Sqe => 5,
            QpState::Err => 6,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => QpState::Reset,
            1 => QpState::Init,
            2 => QpState::Rtr,
            3 => QpState::Rts,
            4 => QpState::Sqd,
            5 => QpState::Sqe,
            _ => QpState::Err,
        }
    }

    /// State encoding of the QP context.
    pub(crate) fn hw(self) -> u32 {
        match self {
            QpState::Reset => HW_RST,
            QpState::Init => 1,
            QpState::Rtr => 2,
            QpState::Rts => 3,
            QpState::Sqe => 4,
            QpState::Sqd => 5,
            QpState::Err => 6,
        }
    }

    /// Decodes the context state; the second value is set while the send
    /// queue drains.
    pub(crate) fn from_hw(v: u32) -> (Self, bool) {
        match v {
            HW_RST => (QpState::Reset, false),
            1 => (QpState::Init, false),
            2 => (QpState::Rtr, false),
            3 => (QpState::Rts, false),
            4 => (QpState::Sqe, false),
            5 => (QpState::Sqd, false),
            HW_DRAINING => (QpState::Sqd, true),
            _ => (QpState::Err, false),
        }
    }

    /// Receive requests may be posted.
    pub(crate) fn can_post_recv(self) -> bool {
        !matches!(self, QpState::Reset | QpState::Err)
    }

    /// Send requests may be posted.
    pub(crate) fn can_post_send(self) -> bool {
        matches!(self, QpState::Rts | QpState::Sqd | QpState::Sqe)
    }
}

const HW_RST: u32 = 0;
const HW_DRAINING: u32 = 7;

/// Transport service of a QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Reliable connected
    Rc,
    /// Unreliable connected
    Uc,
    /// Unreliable datagram
    Ud,
    /// Raw header sends of the special QPs
    Mlx,
}

impl Transport {
    /// Service type field of the QP context.
    pub(crate) fn hw(self) -> u32 {
        match self {
            Transport::Rc => 0,
            Transport::Uc => 1,
            Transport::Ud => 3,
            Transport::Mlx => 7,
        }
    }

    fn column(self) -> usize {
        match self {
            Transport::Ud => 0,
            Transport::Uc => 1,
            Transport::Rc => 2,
            Transport::Mlx => 3,
        }
    }
}

/// A firmware QP state transition command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Transition {
    Rst2Init,
    Init2Init,
    Init2Rtr,
    Rtr2Rts,
    Rts2Rts,
    SqErr2Rts,
    ToErr,
    Rts2Sqd,
    Sqd2Sqd,
    Sqd2Rts,
    ToRst,
}

impl Transition {
    /// Command for moving from `cur` to `new`, if firmware has one.
    pub(crate) fn between(cur: QpState, new: QpState) -> Option<Self> {
        use QpState::{Err, Init, Reset, Rtr, Rts, Sqd, Sqe};
        let t = match (cur, new) {
            (_, Reset) => Transition::ToRst,
            (_, Err) => Transition::ToErr,
            (Reset, Init) => Transition::Rst2Init,
            (Init, Init) => Transition::Init2Init,
            (Init, Rtr) => Transition::Init2Rtr,
            (Rtr, Rts) => Transition::Rtr2Rts,
            (Rts, Rts) => Transition::Rts2Rts,
            (Sqe, Rts) => Transition::SqErr2Rts,
            (Rts, Sqd) => Transition::Rts2Sqd,
            (Sqd, Sqd) => Transition::Sqd2Sqd,
            (Sqd, Rts) => Transition::Sqd2Rts,
            _ => return None,
        };
        Some(t)
    }

    /// Firmware opcode.
    #[must_use]
    pub fn opcode(self) -> u16 {
        match self {
            Transition::Rst2Init => 0x19,
            Transition::Init2Rtr => 0x1a,
            Transition::Rtr2Rts => 0x1b,
            Transition::Rts2Rts => 0x1c,
            Transition::SqErr2Rts => 0x1d,
            Transition::ToErr => 0x1e,
            Transition::Rts2Sqd => 0x1f,
            Transition::Sqd2Rts => 0x20,
            Transition::ToRst => 0x21,
            Transition::Init2Init => 0x2d,
            Transition::Sqd2Sqd => 0x38,
        }
    }

    /// Firmware command name.
    #[must_use]
    pub fn command_name(self) -> &'static str {
        match self {
            Transition::Rst2Init => "RST2INIT_QPEE",
            Transition::Init2Init => "INIT2INIT_QPEE",
            Transition::Init2Rtr => "INIT2RTR_QPEE",
            Transition::Rtr2Rts => "RTR2RTS_QPEE",
            Transition::Rts2Rts => "RTS2RTS_QPEE",
            Transition::SqErr2Rts => "SQERR2RTS_QPEE",
            Transition::ToErr => "2ERR_QPEE",
            Transition::Rts2Sqd => "RTS2SQD_QPEE",
            Transition::Sqd2Sqd => "SQD2SQD_QPEE",
            Transition::Sqd2Rts => "SQD2RTS_QPEE",
            Transition::ToRst => "2RST_QPEE",
        }
    }
}

/// Attribute masks of a legal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Rule {
    pub(crate) required: M,
    pub(crate) optional: M,
}

const fn rule(required: M, optional: M) -> Rule {
    Rule { required, optional }
}

const NONE: M = M::empty();

/// Per transport rules, columns ordered UD, UC, RC, MLX.
type Row = [Rule; 4];

const fn same(r: Rule) -> Row {
    [r, r, r, r]
}

const RST_INIT: Row = [
    rule(M::PKEY_INDEX.union(M::PORT).union(M::QKEY), NONE),
    rule(M::PKEY_INDEX.union(M::PORT).union(M::ACCESS_FLAGS), NONE),
    rule(M::PKEY_INDEX.union(M::PORT).union(M::ACCESS_FLAGS), NONE),
    rule(M::PKEY_INDEX.union(M::QKEY), NONE),
];

const INIT_INIT: Row = [
    rule(NONE, M::PKEY_INDEX.union(M::PORT).union(M::QKEY)),
    rule(NONE, M::PKEY_INDEX.union(M::PORT).union(M::ACCESS_FLAGS)),
    rule(NONE, M::PKEY_INDEX.union(M::PORT).union(M::ACCESS_FLAGS)),
    rule(NONE, M::PKEY_INDEX.union(M::QKEY)),
];

const INIT_RTR: Row = [
    rule(NONE, M::PKEY_INDEX.union(M::QKEY)),
    rule(
        M::AV.union(M::PATH_MTU).union(M::DEST_QPN).union(M::RQ_PSN),
        M::ALT_PATH.union(M::ACCESS_FLAGS).union(M::PKEY_INDEX),
    ),
    rule(
        M::AV
            .union(M::PATH_MTU)
            .union(M::DEST_QPN)
            .union(M::RQ_PSN)
            .union(M::MAX_DEST_RD_ATOMIC)
            .union(M::MIN_RNR_TIMER),
        M::ALT_PATH.union(M::ACCESS_FLAGS).union(M::PKEY_INDEX),
    ),
    rule(NONE, M::PKEY_INDEX.union(M::QKEY)),
];

const RTR_RTS: Row = [
    rule(M::SQ_PSN, M::CUR_STATE.union(M::QKEY)),
    rule(
        M::SQ_PSN,
        M::CUR_STATE
            .union(M::ALT_PATH)
            .union(M::ACCESS_FLAGS)
            .union(M::PATH_MIG_STATE),
    ),
    rule(
        M::TIMEOUT
            .union(M::RETRY_CNT)
            .union(M::RNR_RETRY)
            .union(M::SQ_PSN)
            .union(M::MAX_QP_RD_ATOMIC),
        M::CUR_STATE
            .union(M::ALT_PATH)
            .union(M::ACCESS_FLAGS)
            .union(M::MIN_RNR_TIMER)
            .union(M::PATH_MIG_STATE),
    ),
    rule(M::SQ_PSN, M::CUR_STATE.union(M::QKEY)),
];

const RTS_RTS: Row = [
    rule(NONE, M::CUR_STATE.union(M::QKEY)),
    rule(
        NONE,
        M::CUR_STATE
            .union(M::ACCESS_FLAGS)
            .union(M::ALT_PATH)
            .union(M::PATH_MIG_STATE),
    ),
    rule(
        NONE,
        M::CUR_STATE
            .union(M::ACCESS_FLAGS)
            .union(M::ALT_PATH)
            .union(M::PATH_MIG_STATE)
            .union(M::MIN_RNR_TIMER),
    ),
    rule(NONE, M::CUR_STATE.union(M::QKEY)),
];

const SQD_SQD: Row = [
    rule(NONE, M::PKEY_INDEX.union(M::QKEY)),
    rule(
        NONE,
        M::AV
            .union(M::ALT_PATH)
            .union(M::ACCESS_FLAGS)
            .union(M::PKEY_INDEX)
            .union(M::PATH_MIG_STATE),
    ),
    rule(
        NONE,
        M::PORT
            .union(M::AV)
            .union(M::TIMEOUT)
            .union(M::RETRY_CNT)
            .union(M::RNR_RETRY)
            .union(M::MAX_QP_RD_ATOMIC)
            .union(M::MAX_DEST_RD_ATOMIC)
            .union(M::ALT_PATH)
            .union(M::ACCESS_FLAGS)
            .union(M::PKEY_INDEX)
            .union(M::MIN_RNR_TIMER)
            .union(M::PATH_MIG_STATE),
    ),
    rule(NONE, M::PKEY_INDEX.union(M::QKEY)),
];

/// RC accepts no optional attributes when leaving SQE.
const SQE_RTS: Row = [
    rule(NONE, M::CUR_STATE.union(M::QKEY)),
    rule(NONE, M::CUR_STATE.union(M::ACCESS_FLAGS)),
    rule(NONE, NONE),
    rule(NONE, M::CUR_STATE.union(M::QKEY)),
];

/// Looks up the rule for `cur -> new` on `transport`.
///
/// Moving to RESET or ERR is legal from every state and takes no
/// attributes.
pub(crate) fn rule_for(cur: QpState, new: QpState, transport: Transport) -> Option<Rule> {
    use QpState::{Err, Init, Reset, Rtr, Rts, Sqd, Sqe};
    let row = match (cur, new) {
        (_, Reset | Err) => same(rule(NONE, NONE)),
        (Reset, Init) => RST_INIT,
        (Init, Init) => INIT_INIT,
        (Init, Rtr) => INIT_RTR,
        (Rtr, Rts) => RTR_RTS,
        (Rts, Rts) | (Sqd, Rts) => RTS_RTS,
        (Rts, Sqd) => same(rule(NONE, M::EN_SQD_ASYNC_NOTIFY)),
        (Sqd, Sqd) => SQD_SQD,
        (Sqe, Rts) => SQE_RTS,
        _ => return None,
    };
    row.get(transport.column()).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_reaches_reset_and_err() {
        for v in 0..7 {
            let cur = QpState::from_u8(v);
            for t in [Transport::Rc, Transport::Uc, Transport::Ud, Transport::Mlx] {
                assert_eq!(
                    rule_for(cur, QpState::Reset, t),
                    Some(rule(NONE, NONE))
                );
                assert!(rule_for(cur, QpState::Err, t).is_some());
            }
        }
    }

    #[test]
    fn rc_rtr_requires_path_attributes() {
        let r = rule_for(QpState::Init, QpState::Rtr, Transport::Rc).unwrap();
        assert!(r.required.contains(M::DEST_QPN));
        assert!(r.required.contains(M::MIN_RNR_TIMER));
        let ud = rule_for(QpState::Init, QpState::Rtr, Transport::Ud).unwrap();
        assert!(ud.required.is_empty());
    }

    #[test]
    fn illegal_pairs_have_no_rule() {
        assert!(rule_for(QpState::Reset, QpState::Rts, Transport::Rc).is_none());
        assert!(rule_for(QpState::Init, QpState::Sqd, Transport::Ud).is_none());
        assert!(rule_for(QpState::Rtr, QpState::Rtr, Transport::Uc).is_none());
        assert!(Transition::between(QpState::Rtr, QpState::Init).is_none());
    }

    #[test]
    fn hardware_state_encoding() {
        assert_eq!(QpState::Sqe.hw(), 4);
        assert_eq!(QpState::Sqd.hw(), 5);
        assert_eq!(QpState::from_hw(7), (QpState::Sqd, true));
        for v in 0..7 {
            let s = QpState::from_u8(v);
            assert_eq!(QpState::from_hw(s.hw()), (s, false));
            assert_eq!(QpState::from_u8(s.to_u8()), s);
        }
    }

    #[test]
    fn transition_opcodes() {
        assert_eq!(
            Transition::between(QpState::Rts, QpState::Reset),
            Some(Transition::ToRst)
        );
        assert_eq!(Transition::Init2Init.opcode(), 0x2d);
        assert_eq!(Transition::Sqd2Sqd.opcode(), 0x38);
        assert_eq!(Transition::ToErr.command_name(), "2ERR_QPEE");
    }

    #[test]
    fn sqe_to_rts_takes_no_optional_attributes_on_rc() {
        let rc = rule_for(QpState::Sqe, QpState::Rts, Transport::Rc).unwrap();
        assert_eq!(rc, rule(NONE, NONE));
        let uc = rule_for(QpState::Sqe, QpState::Rts, Transport::Uc).unwrap();
        assert!(uc.optional.contains(M::ACCESS_FLAGS));
    }
}

use dicomnet_ul::pdu::reader::read_pdu;
use dicomnet_ul::pdu::writer::write_pdu;
use dicomnet_ul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationAC, AssociationRJ,
    AssociationRJResult, AssociationRJServiceUserReason, AssociationRJSource, AssociationRQ,
    PDataValue, PDataValueType, Pdu, PresentationContextProposed, PresentationContextResult,
    PresentationContextResultReason, UserIdentity, UserIdentityType, UserVariableItem,
    DEFAULT_MAX_PDU, PDU_HEADER_SIZE,
};
use matches::matches;
use std::io::Cursor;

fn round_trip(pdu: Pdu) -> Pdu {
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap()
}

#[test]
fn can_read_write_associate_rq() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.2.2.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.9.7433.1.1".to_string()),
            UserVariableItem::ImplementationVersionName("dicomnet".to_string()),
            UserVariableItem::UserIdentityItem(UserIdentity::username_password(
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let result = round_trip(association_rq.clone().into());

    if let Pdu::AssociationRQ(read) = result {
        assert_eq!(read, association_rq);
        assert!(matches!(
            &read.user_variables[3],
            UserVariableItem::UserIdentityItem(identity)
            if identity.identity_type() == UserIdentityType::UsernamePassword
                && identity.primary_field() == b"MyUsername"
                && identity.secondary_field() == b"MyPassword"
        ));
    } else {
        panic!("invalid pdu type");
    }
}

/// The total length header of an A-ASSOCIATE-RQ
/// equals the length of the payload that follows it.
#[test]
fn associate_rq_length_header_matches_payload() {
    let association_rq = AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "1.2.840.10008.1.1".to_string(),
            transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("1.2.826.0.1.3680043.9.7433.1.1".to_string()),
        ],
    };

    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &association_rq.into()).unwrap();

    let declared =
        u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
    assert_eq!(declared, bytes.len() - PDU_HEADER_SIZE as usize);

    // AE titles occupy exactly 16 bytes each, space padded
    assert_eq!(&bytes[10..26], b"SCP             ");
    assert_eq!(&bytes[26..42], b"SCU             ");
}

#[test]
fn can_read_write_associate_ac() {
    let association_ac = AssociationAC {
        protocol_version: 1,
        called_ae_title: "SCP".to_string(),
        calling_ae_title: "SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(32_768)],
    };

    let result = round_trip(association_ac.clone().into());
    assert_eq!(result, Pdu::AssociationAC(association_ac));
}

#[test]
fn can_read_write_associate_rj() {
    let association_rj = AssociationRJ {
        result: AssociationRJResult::Transient,
        source: AssociationRJSource::ServiceUser(AssociationRJServiceUserReason::NoReasonGiven),
    };

    let result = round_trip(association_rj.clone().into());
    assert_eq!(result, Pdu::AssociationRJ(association_rj));
}

#[test]
fn can_read_write_pdata() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: (0..64).collect(),
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0xFF; 128],
            },
        ],
    };

    assert_eq!(round_trip(pdu.clone()), pdu);
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(round_trip(Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(round_trip(Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(round_trip(abort.clone()), abort);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(round_trip(abort.clone()), abort);
}

#[test]
fn strict_mode_rejects_oversized_pdus() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8_192],
        }],
    };
    let mut bytes = vec![0u8; 0];
    write_pdu(&mut bytes, &pdu).unwrap();

    let outcome = read_pdu(&mut Cursor::new(&bytes), 4_096, true);
    assert!(matches!(
        outcome,
        Err(dicomnet_ul::pdu::reader::Error::PduTooLarge { .. })
    ));

    // lenient mode tolerates it up to the hard limit
    let outcome = read_pdu(&mut Cursor::new(&bytes), 4_096, false);
    assert!(matches!(outcome, Ok(Some(Pdu::PData { .. }))));
}

#[test]
fn end_of_stream_before_pdu_yields_none() {
    let outcome = read_pdu(&mut Cursor::new(&[]), DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(outcome, None);
}

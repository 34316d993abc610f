//! Built-in GoldSrc message catalog and client message alphabet.

use ricochet_core::schema::{
    BitField, BitWidth, Condition, CustomMessageRules, IntWidth, Layout, Schema, SwitchCase,
};
use ricochet_core::template::{FieldTemplate, MessageTemplate, PrefixWidth};

const SVC_SPAWNBASELINE: u8 = 0x16;
const SVC_NEWUSERMSG: u8 = 0x27;
const LAST_ENGINE_OPCODE: u8 = 0x3A;

/// Temp-entity types with a fixed body length.
const TE_FIXED_LENGTHS: &[(i64, usize)] = &[
    (0, 24),
    (1, 20),
    (2, 6),
    (3, 11),
    (4, 6),
    (5, 10),
    (6, 12),
    (7, 17),
    (8, 16),
    (9, 6),
    (10, 6),
    (11, 6),
    (12, 8),
    (14, 9),
    (15, 19),
    (17, 10),
    (18, 16),
    (19, 24),
    (20, 24),
    (21, 24),
    (22, 10),
    (23, 11),
    (24, 16),
    (25, 19),
    (27, 12),
    (28, 16),
    (30, 19),
    (31, 17),
    (99, 2),
    (100, 10),
    (101, 14),
    (102, 12),
    (103, 14),
    (104, 9),
    (105, 5),
    (106, 17),
    (107, 13),
    (108, 24),
    (109, 9),
    (110, 17),
    (111, 7),
    (112, 10),
    (113, 19),
    (114, 19),
    (115, 12),
    (116, 7),
    (117, 7),
    (118, 9),
    (119, 16),
    (120, 18),
    (121, 6),
    (122, 10),
    (123, 13),
    (124, 7),
    (125, 1),
    (126, 18),
    (127, 15),
];

fn bytes(len: usize) -> Layout {
    Layout::Bytes { len }
}

fn int(name: &str, width: IntWidth) -> Layout {
    Layout::Int {
        name: Some(name.to_string()),
        width,
    }
}

fn seq(fields: Vec<Layout>) -> Layout {
    Layout::Sequence { fields }
}

fn when(field: &str, condition: Condition, then: Layout) -> Layout {
    Layout::If {
        field: field.to_string(),
        condition,
        then: Box::new(then),
        otherwise: None,
    }
}

fn uint(name: &str, bits: u32) -> BitField {
    BitField::Uint {
        name: Some(name.to_string()),
        bits: BitWidth::Fixed(bits),
    }
}

fn skip_bits(bits: u32) -> BitField {
    BitField::Uint {
        name: None,
        bits: BitWidth::Fixed(bits),
    }
}

fn bits_when(field: &str, condition: Condition, then: Vec<BitField>) -> BitField {
    BitField::If {
        field: field.to_string(),
        condition,
        then,
        otherwise: Vec::new(),
    }
}

fn server_info() -> Layout {
    seq(vec![
        int("protocol", IntWidth::U32),
        int("server_count", IntWidth::U32),
        int("server_crc", IntWidth::U32),
        bytes(16),
        int("maxclients", IntWidth::U8),
        int("playernum", IntWidth::U8),
        int("gametype", IntWidth::U8),
        Layout::Cstring,
        Layout::Cstring,
        Layout::Cstring,
        Layout::Cstring,
        int("has_more", IntWidth::U8),
        when(
            "has_more",
            Condition::NonZero,
            seq(vec![Layout::Prefixed { width: IntWidth::U8 }, bytes(16)]),
        ),
    ])
}

fn delta_description() -> Layout {
    let mask =
        |bit: u32, then: Vec<BitField>| bits_when("bits", Condition::MaskSet(1 << bit), then);
    let delta = vec![
        uint("nbytes", 3),
        BitField::Uint {
            name: Some("bits".to_string()),
            bits: BitWidth::Field {
                name: "nbytes".to_string(),
                scale: 8,
            },
        },
        mask(0, vec![skip_bits(32)]),
        mask(1, vec![BitField::Cstring]),
        mask(2, vec![skip_bits(16)]),
        mask(3, vec![skip_bits(8)]),
        mask(4, vec![skip_bits(8)]),
        mask(5, vec![skip_bits(32)]),
        mask(6, vec![skip_bits(32)]),
    ];
    seq(vec![
        Layout::Cstring,
        int("fieldcount", IntWidth::U16),
        Layout::Bits {
            fields: vec![BitField::Repeat {
                count: "fieldcount".to_string(),
                body: delta,
            }],
        },
    ])
}

fn temp_entity() -> Layout {
    let mut cases: Vec<SwitchCase> = TE_FIXED_LENGTHS
        .iter()
        .map(|&(value, len)| SwitchCase {
            value,
            layout: bytes(len),
        })
        .collect();
    cases.push(SwitchCase {
        value: 13,
        layout: seq(vec![
            bytes(8),
            int("has_more", IntWidth::U16),
            when("has_more", Condition::NonZero, bytes(2)),
        ]),
    });
    cases.push(SwitchCase {
        value: 29,
        layout: seq(vec![
            bytes(5),
            int("has_more", IntWidth::U8),
            when("has_more", Condition::Equals(2), bytes(2)),
            bytes(14),
            Layout::Cstring,
        ]),
    });
    Layout::Switch {
        width: IntWidth::U8,
        name: Some("type".to_string()),
        cases,
        default: None,
    }
}

fn resource_list() -> Layout {
    let resource = vec![
        uint("type", 4),
        BitField::Cstring,
        uint("index", 12),
        uint("download_size", 24),
        uint("flags", 3),
        bits_when("flags", Condition::MaskSet(1 << 2), vec![BitField::Bytes { len: 16 }]),
        uint("has_reserved", 1),
        bits_when("has_reserved", Condition::NonZero, vec![BitField::Bytes { len: 32 }]),
    ];
    let extra = vec![
        uint("extra_flag", 1),
        bits_when(
            "extra_flag",
            Condition::NonZero,
            vec![
                uint("inner_flag", 1),
                BitField::If {
                    field: "inner_flag".to_string(),
                    condition: Condition::NonZero,
                    then: vec![skip_bits(5)],
                    otherwise: vec![skip_bits(10)],
                },
            ],
        ),
    ];
    Layout::Bits {
        fields: vec![
            uint("total", 12),
            BitField::Repeat {
                count: "total".to_string(),
                body: resource,
            },
            uint("has_more", 1),
            bits_when(
                "has_more",
                Condition::NonZero,
                vec![BitField::RepeatWhile {
                    field: "extra_flag".to_string(),
                    body: extra,
                }],
            ),
        ],
    }
}

/// Server-to-client messages of the GoldSrc engine, opcodes 0x00 to 0x3A.
pub fn goldsrc_schema() -> Schema {
    let rules = CustomMessageRules {
        threshold: LAST_ENGINE_OPCODE,
        register_opcode: SVC_NEWUSERMSG,
        id_field: "imsg".to_string(),
        size_field: "isize".to_string(),
        inline_size_sentinel: -1,
    };
    let messages: Vec<(u8, &str, Layout)> = vec![
        (0x00, "bad", Layout::Empty),
        (0x01, "nop", Layout::Empty),
        (0x02, "disconnect", Layout::Cstring),
        (0x03, "event", Layout::Empty),
        (0x04, "version", Layout::Empty),
        (0x05, "setview", int("viewentity", IntWidth::U16)),
        (0x06, "sound", Layout::Empty),
        (0x07, "time", Layout::Empty),
        (0x08, "print", Layout::Cstring),
        (0x09, "stufftext", Layout::Cstring),
        (0x0A, "setangle", Layout::Empty),
        (0x0B, "serverinfo", server_info()),
        (0x0C, "lightstyle", Layout::Empty),
        (
            0x0D,
            "updateuserinfo",
            seq(vec![
                int("playernumber", IntWidth::U8),
                int("userid", IntWidth::U32),
                Layout::Cstring,
                bytes(16),
            ]),
        ),
        (0x0E, "deltadescription", delta_description()),
        (0x0F, "clientdata", Layout::Empty),
        (0x10, "stopsound", Layout::Empty),
        (0x11, "pings", Layout::Empty),
        (0x12, "particle", Layout::Empty),
        (0x13, "damage", Layout::Empty),
        (0x14, "spawnstatic", Layout::Empty),
        (0x15, "event_reliable", Layout::Empty),
        (SVC_SPAWNBASELINE, "spawnbaseline", Layout::Empty),
        (0x17, "temp_entity", temp_entity()),
        (0x18, "setpause", Layout::Empty),
        (0x19, "signonnum", int("num", IntWidth::U8)),
        (0x1A, "centerprint", Layout::Empty),
        (0x1B, "killedmonster", Layout::Empty),
        (0x1C, "foundsecret", Layout::Empty),
        (0x1D, "spawnstaticsound", bytes(14)),
        (0x1E, "intermission", Layout::Empty),
        (0x1F, "finale", Layout::Empty),
        (
            0x20,
            "cdtrack",
            seq(vec![int("cdtrack", IntWidth::U8), int("looptrack", IntWidth::U8)]),
        ),
        (0x21, "restore", Layout::Empty),
        (0x22, "cutscene", Layout::Empty),
        (0x23, "weaponanim", Layout::Empty),
        (0x24, "decalname", Layout::Empty),
        (0x25, "roomtype", Layout::Empty),
        (0x26, "addangle", Layout::Empty),
        (
            SVC_NEWUSERMSG,
            "newusermsg",
            seq(vec![int("imsg", IntWidth::U8), int("isize", IntWidth::I8), bytes(16)]),
        ),
        (0x28, "packetentities", Layout::Empty),
        (0x29, "deltapacketentities", Layout::Empty),
        (0x2A, "choke", Layout::Empty),
        (0x2B, "resourcelist", resource_list()),
        // 16 floats, footsteps byte, 9 floats, then the sky name.
        (0x2C, "newmovevars", seq(vec![bytes(16 * 4 + 1 + 9 * 4), Layout::Cstring])),
        (
            0x2D,
            "resourcerequest",
            seq(vec![int("arg", IntWidth::U32), int("startindex", IntWidth::U32)]),
        ),
        (0x2E, "customization", Layout::Empty),
        (0x2F, "crosshairangle", Layout::Empty),
        (0x30, "soundfade", Layout::Empty),
        (0x31, "filetxferfailed", Layout::Empty),
        (0x32, "hltv", Layout::Empty),
        (0x33, "director", Layout::Empty),
        (0x34, "voiceinit", Layout::Empty),
        (0x35, "voicedata", Layout::Empty),
        (
            0x36,
            "sendextrainfo",
            seq(vec![Layout::Cstring, int("allow_cheats", IntWidth::U8)]),
        ),
        (0x37, "timescale", Layout::Empty),
        (0x38, "resourcelocation", Layout::Empty),
        (0x39, "sendcvarvalue", Layout::Empty),
        (0x3A, "sendcvarvalue2", Layout::Empty),
    ];

    messages
        .into_iter()
        .fold(Schema::new(Some(rules), Some(SVC_SPAWNBASELINE)), |schema, (opcode, name, layout)| {
            schema.with_message(opcode, name, layout)
        })
}

/// Client messages; the first four form the default alphabet.
pub fn client_templates() -> Vec<MessageTemplate> {
    let cstring = || FieldTemplate::Cstring { max_len: 256 };
    vec![
        MessageTemplate::new("nop", 0x01, vec![]),
        MessageTemplate::new("stringcmd", 0x03, vec![cstring()]),
        MessageTemplate::new(
            "voicedata",
            0x08,
            vec![FieldTemplate::Prefixed {
                width: PrefixWidth::U16,
                max_len: 1024,
            }],
        ),
        MessageTemplate::new("cvarvalue", 0x0a, vec![cstring()]),
        MessageTemplate::new("cvarvalue2", 0x0b, vec![FieldTemplate::U16, cstring(), cstring()]),
    ]
}

pub fn default_alphabet() -> Vec<MessageTemplate> {
    client_templates().into_iter().take(4).collect()
}

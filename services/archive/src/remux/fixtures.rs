use super::boxes::{children, read_u32, TFDT, TFHD};
use super::{read_decode_time, TRUN_DATA_OFFSET, TRUN_SAMPLE_DURATION};
use bytes::{BufMut, BytesMut};

pub(crate) fn boxed(buf: &mut BytesMut, box_type: &[u8; 4], body: impl FnOnce(&mut BytesMut)) {
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(box_type);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

pub(crate) struct Track {
    pub id: u32,
    pub timescale: u32,
    pub trex_default: u32,
}

pub(crate) fn init(buf: &mut BytesMut, tracks: &[Track]) {
    boxed(buf, b"ftyp", |b| {
        b.put_slice(b"isom");
        b.put_u32(0x200);
        b.put_slice(b"isomiso6");
    });
    boxed(buf, b"moov", |b| {
        for track in tracks {
            boxed(b, b"trak", |b| {
                boxed(b, b"tkhd", |b| {
                    b.put_u32(0x0000_0003);
                    b.put_u32(0); // creation
                    b.put_u32(0); // modification
                    b.put_u32(track.id);
                    b.put_bytes(0, 68);
                });
                boxed(b, b"mdia", |b| {
                    boxed(b, b"mdhd", |b| {
                        b.put_u32(0);
                        b.put_u32(0);
                        b.put_u32(0);
                        b.put_u32(track.timescale);
                        b.put_u32(0);
                        b.put_u32(0);
                    });
                });
            });
        }
        boxed(b, b"mvex", |b| {
            for track in tracks {
                boxed(b, b"trex", |b| {
                    b.put_u32(0);
                    b.put_u32(track.id);
                    b.put_u32(1);
                    b.put_u32(track.trex_default);
                    b.put_u32(0);
                    b.put_u32(0);
                });
            }
        });
    });
}

pub(crate) struct Traf {
    pub track: u32,
    pub tfdt: u64,
    pub version: u8,
    pub durations: Option<Vec<u32>>,
    pub samples: u32,
}

pub(crate) fn traf(track: u32, tfdt: u64, durations: &[u32]) -> Traf {
    Traf {
        track,
        tfdt,
        version: 1,
        durations: Some(durations.to_vec()),
        samples: durations.len() as u32,
    }
}

pub(crate) fn bare_traf(track: u32, tfdt: u64, samples: u32) -> Traf {
    Traf {
        track,
        tfdt,
        version: 1,
        durations: None,
        samples,
    }
}

pub(crate) fn fragment(buf: &mut BytesMut, seq: u32, trafs: &[Traf]) {
    boxed(buf, b"moof", |b| {
        boxed(b, b"mfhd", |b| {
            b.put_u32(0);
            b.put_u32(seq);
        });
        for t in trafs {
            boxed(b, b"traf", |b| {
                boxed(b, b"tfhd", |b| {
                    b.put_u32(0x0002_0000);
                    b.put_u32(t.track);
                });
                boxed(b, b"tfdt", |b| {
                    b.put_u32((t.version as u32) << 24);
                    if t.version == 1 {
                        b.put_u64(t.tfdt);
                    } else {
                        b.put_u32(t.tfdt as u32);
                    }
                });
                boxed(b, b"trun", |b| {
                    let mut flags = TRUN_DATA_OFFSET | 0x200;
                    if t.durations.is_some() {
                        flags |= TRUN_SAMPLE_DURATION;
                    }
                    b.put_u32(flags);
                    b.put_u32(t.samples);
                    b.put_u32(0);
                    for i in 0..t.samples as usize {
                        if let Some(d) = &t.durations {
                            b.put_u32(d[i]);
                        }
                        b.put_u32(4);
                    }
                });
            });
        }
    });
    let samples: u32 = trafs.iter().map(|t| t.samples).sum();
    boxed(buf, b"mdat", |b| b.put_bytes(0xAB, samples as usize * 4));
}

/// One 90 kHz video track.
pub(crate) fn video() -> Vec<Track> {
    vec![Track {
        id: 1,
        timescale: 90_000,
        trex_default: 0,
    }]
}

/// Init boxes followed by one fragment per entry of `fragments`.
pub(crate) fn input(tracks: &[Track], fragments: Vec<Vec<Traf>>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    init(&mut buf, tracks);
    for (i, trafs) in fragments.iter().enumerate() {
        fragment(&mut buf, i as u32 + 1, trafs);
    }
    buf.to_vec()
}

#[derive(Debug, Default)]
pub(crate) struct Parsed {
    pub ftyp: usize,
    pub moov: usize,
    pub mdat: usize,
    pub sequences: Vec<u32>,
    /// (track, tfdt) in output order
    pub decode_times: Vec<(u32, u64)>,
}

pub(crate) fn parse_output(out: &[u8]) -> Parsed {
    let mut parsed = Parsed::default();
    for top in children(out).unwrap() {
        match &top.box_type {
            b"ftyp" => parsed.ftyp += 1,
            b"moov" => parsed.moov += 1,
            b"mdat" => parsed.mdat += 1,
            b"moof" => {
                let moof = top.payload(out);
                for child in children(moof).unwrap() {
                    let body = child.payload(moof);
                    match &child.box_type {
                        b"mfhd" => parsed.sequences.push(read_u32(body, 4)),
                        b"traf" => {
                            let kids = children(body).unwrap();
                            let tfhd = kids.iter().find(|c| c.box_type == TFHD).unwrap();
                            let track = read_u32(tfhd.payload(body), 4);
                            if let Some(tfdt) = kids.iter().find(|c| c.box_type == TFDT) {
                                let time = read_decode_time(tfdt.payload(body)).unwrap();
                                parsed.decode_times.push((track, time));
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    parsed
}

pub(crate) fn track_times(parsed: &Parsed, track: u32) -> Vec<u64> {
    parsed
        .decode_times
        .iter()
        .filter(|(t, _)| *t == track)
        .map(|(_, time)| *time)
        .collect()
}

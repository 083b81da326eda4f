use std::{cell::RefCell, rc::Rc};

use embedded_sdmmc::{Block, BlockCount, BlockIdx};

use super::names::{alias, encode_index, parse_index, plain_name};
use super::*;

const PARTITION_START: u32 = 1;
const RESERVED_SECTORS: u32 = 1;
const FAT_SECTORS: u32 = 20;
const ROOT_ENTRIES: u32 = 512;
const DATA_CLUSTERS: u32 = 4_200;
const PARTITION_SECTORS: u32 =
    RESERVED_SECTORS + 2 * FAT_SECTORS + ROOT_ENTRIES * 32 / 512 + DATA_CLUSTERS;

/// Freshly formatted FAT16 card image held in RAM.
#[derive(Clone)]
struct RamCard {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl RamCard {
    fn formatted() -> Self {
        let blocks = (PARTITION_START + PARTITION_SECTORS) as usize;
        let mut image = vec![0u8; blocks * Block::LEN];

        let mbr = &mut image[..512];
        mbr[446 + 4] = 0x06;
        mbr[446 + 8..446 + 12].copy_from_slice(&PARTITION_START.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&PARTITION_SECTORS.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;

        let start = PARTITION_START as usize * 512;
        let boot = &mut image[start..start + 512];
        boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        boot[3..11].copy_from_slice(b"MSWIN4.1");
        boot[11..13].copy_from_slice(&512u16.to_le_bytes());
        boot[13] = 1;
        boot[14..16].copy_from_slice(&(RESERVED_SECTORS as u16).to_le_bytes());
        boot[16] = 2;
        boot[17..19].copy_from_slice(&(ROOT_ENTRIES as u16).to_le_bytes());
        boot[19..21].copy_from_slice(&(PARTITION_SECTORS as u16).to_le_bytes());
        boot[21] = 0xF8;
        boot[22..24].copy_from_slice(&(FAT_SECTORS as u16).to_le_bytes());
        boot[24..26].copy_from_slice(&32u16.to_le_bytes());
        boot[26..28].copy_from_slice(&2u16.to_le_bytes());
        boot[28..32].copy_from_slice(&PARTITION_START.to_le_bytes());
        boot[36] = 0x80;
        boot[38] = 0x29;
        boot[39..43].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        boot[43..54].copy_from_slice(b"FIGURINE   ");
        boot[54..62].copy_from_slice(b"FAT16   ");
        boot[510] = 0x55;
        boot[511] = 0xAA;

        for fat in 0..2 {
            let offset = start + (RESERVED_SECTORS + fat * FAT_SECTORS) as usize * 512;
            image[offset..offset + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
        }

        Self {
            bytes: Rc::new(RefCell::new(image)),
        }
    }
}

impl BlockDevice for RamCard {
    type Error = core::convert::Infallible;

    fn read(&self, blocks: &mut [Block], start_block_idx: BlockIdx, _reason: &str) -> Result<(), Self::Error> {
        let bytes = self.bytes.borrow();
        for (index, block) in blocks.iter_mut().enumerate() {
            let offset = (start_block_idx.0 as usize + index) * Block::LEN;
            block
                .contents
                .copy_from_slice(&bytes[offset..offset + Block::LEN]);
        }
        Ok(())
    }

    fn write(&self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        let mut bytes = self.bytes.borrow_mut();
        for (index, block) in blocks.iter().enumerate() {
            let offset = (start_block_idx.0 as usize + index) * Block::LEN;
            bytes[offset..offset + Block::LEN].copy_from_slice(&block.contents);
        }
        Ok(())
    }

    fn num_blocks(&self) -> Result<BlockCount, Self::Error> {
        Ok(BlockCount((self.bytes.borrow().len() / Block::LEN) as u32))
    }
}

fn mounted(card: &RamCard) -> SdFileSystem<RamCard, FixedTimeSource> {
    let mut fs = SdFileSystem::new(card.clone(), FixedTimeSource);
    fs.mount().unwrap();
    fs
}

fn read(fs: &mut SdFileSystem<RamCard, FixedTimeSource>, path: &str) -> Vec<u8> {
    let mut buf = vec![0u8; fs.size(path).unwrap() as usize];
    let read = fs.read_at(path, 0, &mut buf).unwrap();
    buf.truncate(read);
    buf
}

fn names_in(fs: &mut SdFileSystem<RamCard, FixedTimeSource>, dir: &str) -> Vec<String> {
    let mut names: Vec<String> = fs.list(dir).unwrap().into_iter().map(|entry| entry.name).collect();
    names.sort();
    names
}

#[test]
fn short_names_pass_through_upper_cased() {
    let plain = |name| plain_name(name).unwrap().map(|text| String::from(text.as_str()));
    assert_eq!(plain("beep.wav").as_deref(), Some("BEEP.WAV"));
    assert_eq!(plain("figures").as_deref(), Some("FIGURES"));
    assert_eq!(plain("7").as_deref(), Some("7"));
    assert_eq!(plain("mani~b48.jso").as_deref(), Some("MANI~B48.JSO"));
    assert_eq!(plain("100.wav.tmp"), None);
    assert_eq!(plain("manifest.json"), None);
}

#[test]
fn aliases_start_at_the_name_hash_and_step_on() {
    let first = alias("100.wav.tmp", 0).unwrap();
    assert_eq!(first.as_str(), "100W~11F.TMP");
    assert_eq!(alias("100.wav.tmp", 1).unwrap().as_str(), "100W~120.TMP");
    assert_eq!(alias("manifest.json", 0).unwrap().as_str(), "MANI~B48.JSO");
    assert_eq!(
        alias("track-118.wav", 0).unwrap(),
        alias("track-600.wav", 0).unwrap()
    );

    let odd = alias("a b+c.wav", 0).unwrap();
    assert!(odd.starts_with("AB_C~"));
    assert!(odd.ends_with(".WAV"));
    let dotted = alias(".hidden", 0).unwrap();
    assert!(dotted.starts_with("HIDD~"));
    assert!(!dotted.contains('.'));
}

#[test]
fn invalid_components_are_rejected() {
    assert_eq!(plain_name(""), Err(StorageError::InvalidPath));
    assert_eq!(plain_name(".."), Err(StorageError::InvalidPath));
    assert_eq!(plain_name("a\nb"), Err(StorageError::InvalidPath));
    assert_eq!(plain_name("longname.idx"), Err(StorageError::InvalidPath));
    assert_eq!(split_path("/audio/a.wav"), Ok(("/audio", "a.wav")));
    assert_eq!(split_path("/beep.wav"), Ok(("/", "beep.wav")));
    assert_eq!(split_path("audio/a.wav"), Err(StorageError::InvalidPath));
    assert_eq!(split_path("/audio/"), Err(StorageError::InvalidPath));
}

#[test]
fn index_text_skips_malformed_lines() {
    let entries = parse_index(b"MANI~B48.JSO\tmanifest.json\nnot an entry\n100~11F.TMP\t\n");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].alias.as_str(), "MANI~B48.JSO");
    assert_eq!(entries[0].long, "manifest.json");
    assert_eq!(encode_index(&entries), b"MANI~B48.JSO\tmanifest.json\n");
}

#[test]
fn long_names_round_trip_and_survive_remount() {
    let card = RamCard::formatted();
    let mut fs = mounted(&card);
    fs.create_dir("/figures").unwrap();
    fs.create_dir("/figures/7").unwrap();
    fs.write("/figures/7/manifest.json", b"{\"id\":7}").unwrap();

    assert!(fs.exists("/figures/7/manifest.json"));
    assert_eq!(read(&mut fs, "/figures/7/manifest.json"), b"{\"id\":7}");
    let listed = fs.list("/figures/7").unwrap();
    assert_eq!(
        listed,
        [DirEntry {
            name: String::from("manifest.json"),
            is_dir: false,
            size: 8,
        }]
    );

    fs.unmount();
    let mut fs = mounted(&card);
    assert_eq!(read(&mut fs, "/figures/7/manifest.json"), b"{\"id\":7}");
}

#[test]
fn colliding_long_names_get_distinct_entries() {
    let card = RamCard::formatted();
    let mut fs = mounted(&card);
    fs.create_dir("/audio").unwrap();
    fs.write("/audio/track-118.wav", b"first").unwrap();
    fs.write("/audio/track-600.wav", b"second").unwrap();

    assert_eq!(read(&mut fs, "/audio/track-118.wav"), b"first");
    assert_eq!(read(&mut fs, "/audio/track-600.wav"), b"second");
    assert_eq!(names_in(&mut fs, "/audio"), ["track-118.wav", "track-600.wav"]);
}

#[test]
fn rename_publishes_a_temp_file() {
    let card = RamCard::formatted();
    let mut fs = mounted(&card);
    fs.create_dir("/audio").unwrap();
    fs.write("/audio/100.wav.tmp", b"pcm").unwrap();
    fs.write("/audio/100.wav", b"old").unwrap();

    fs.rename("/audio/100.wav.tmp", "/audio/100.wav").unwrap();

    assert!(!fs.exists("/audio/100.wav.tmp"));
    assert_eq!(read(&mut fs, "/audio/100.wav"), b"pcm");
    assert_eq!(names_in(&mut fs, "/audio"), ["100.wav"]);
}

#[test]
fn aliased_directories_resolve_in_paths() {
    let card = RamCard::formatted();
    let mut fs = mounted(&card);
    fs.create_dir("/figures").unwrap();
    fs.create_dir("/figures/fox-and-friends").unwrap();
    fs.write("/figures/fox-and-friends/1.wav", b"x").unwrap();

    assert_eq!(read(&mut fs, "/figures/fox-and-friends/1.wav"), b"x");
    let listed = fs.list("/figures").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "fox-and-friends");
    assert!(listed[0].is_dir);
}

#[test]
fn files_are_removed_and_directories_are_kept() {
    let card = RamCard::formatted();
    let mut fs = mounted(&card);
    fs.create_dir("/figures").unwrap();
    fs.create_dir("/figures/7").unwrap();
    fs.write("/figures/7/manifest.json", b"{}").unwrap();

    for entry in fs.list("/figures/7").unwrap() {
        fs.remove(&format!("/figures/7/{}", entry.name)).unwrap();
    }

    assert!(!fs.exists("/figures/7/manifest.json"));
    assert!(fs.list("/figures/7").unwrap().is_empty());
    assert_eq!(fs.remove("/figures/7"), Err(StorageError::Unsupported));
    assert!(fs.exists("/figures/7"));
    assert_eq!(fs.remove("/figures/7/manifest.json"), Err(StorageError::NotFound));
}

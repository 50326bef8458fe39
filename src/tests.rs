use rand::prelude::*;

use crate::addr::Addr;
use crate::bbt::{self, BadBlockTable, BlockState};
use crate::buf;
use crate::config::{EmuConfig, SEED};
use crate::dev::Device;
use crate::emu::EmuDriver;
use crate::sblk::SpanningBlock;
use crate::vblk::VirtualBlock;

fn open(config: &EmuConfig) -> Device {
    Device::open("emu0", EmuDriver::new(config).unwrap()).unwrap()
}

#[test]
fn single_page_round_trip_on_one_block() {
    let config = EmuConfig::default()
        .channels(1)
        .luns(1)
        .planes(2)
        .blocks(10)
        .pages(4)
        .sectors(4)
        .sector_nbytes(4096);
    let dev = open(&config);
    assert_eq!(dev.geo().vpg_nbytes(), 32768);
    assert_eq!(dev.geo().vblk_nbytes(), 131072);

    let mut vblk = VirtualBlock::on_device(&dev, Addr::new(0, 0, 0, 3, 0, 0).unwrap()).unwrap();
    vblk.erase().unwrap();

    let mut data = dev.buf_alloc(32768).unwrap();
    buf::fill(&mut data);
    assert_eq!(vblk.write(&data).unwrap(), 32768);
    assert_eq!(vblk.pos_write(), 32768);

    let mut back = dev.buf_alloc(32768).unwrap();
    vblk.pread(&mut back, 0).unwrap();
    assert_eq!(&back[..], &data[..]);
}

#[test]
fn partial_stripe_is_padded_to_the_row() {
    let config = EmuConfig::default()
        .channels(2)
        .luns(2)
        .planes(1)
        .sectors(1);
    let dev = open(&config);

    let mut sblk = SpanningBlock::new(&dev, 0, 1, 0, 1, 0).unwrap();
    assert_eq!(sblk.stripe_width(), 4);
    sblk.erase().unwrap();

    let vpg_nbytes = dev.geo().vpg_nbytes();
    let mut data = dev.buf_alloc(3 * vpg_nbytes).unwrap();
    buf::fill(&mut data);
    sblk.write(&data).unwrap();

    assert_eq!(sblk.pad().unwrap(), vpg_nbytes);
    assert_eq!(sblk.pos_write() % sblk.stripe_nbytes(), 0);
    assert_eq!(sblk.pos_write(), 4 * vpg_nbytes);

    // the filler landed on the fourth LUN
    let mut filler = dev.buf_alloc(vpg_nbytes).unwrap();
    sblk.pread(&mut filler, 3 * vpg_nbytes).unwrap();
    let mut expected = dev.buf_alloc(vpg_nbytes).unwrap();
    buf::fill(&mut expected);
    assert_eq!(buf::diff(&expected, &filler), 0);
}

#[test]
fn spanning_and_virtual_views_agree() {
    let dev = open(&EmuConfig::default());
    let vpg_nbytes = dev.geo().vpg_nbytes();

    let mut sblk = SpanningBlock::new(&dev, 0, 1, 0, 1, 4).unwrap();
    sblk.erase().unwrap();
    let mut data = dev.buf_alloc(sblk.stripe_nbytes()).unwrap();
    let mut rng = SmallRng::seed_from_u64(SEED);
    rng.fill_bytes(&mut data);
    sblk.write(&data).unwrap();

    // unit 2 of row 0 is channel 1, LUN 0
    let mut vblk = VirtualBlock::on_device(&dev, Addr::new(1, 0, 0, 4, 0, 0).unwrap()).unwrap();
    let mut page = dev.buf_alloc(vpg_nbytes).unwrap();
    vblk.pread(&mut page, 0).unwrap();
    assert_eq!(&page[..], &data[2 * vpg_nbytes..3 * vpg_nbytes]);
}

#[test]
fn scrambled_reads_differ_only_in_dont_care_bytes() {
    let config = EmuConfig::default().quirk(true);
    let dev = open(&config);

    let mut vblk = VirtualBlock::new(&dev);
    vblk.get().unwrap();
    vblk.erase().unwrap();

    let mut data = dev.buf_alloc(2 * dev.geo().vpg_nbytes()).unwrap();
    buf::fill(&mut data);
    vblk.write(&data).unwrap();

    let mut back = dev.buf_alloc(data.len()).unwrap();
    vblk.read(&mut back).unwrap();
    assert_eq!(buf::diff_masked(&data, &back, config.dont_care()), 0);
    assert!(buf::diff(&data, &back) > 0);

    vblk.put().unwrap();
}

#[test]
fn marked_block_shows_in_table_and_is_not_handed_out() {
    let dev = open(&EmuConfig::default().channels(1).luns(1).blocks(2));
    let blk = Addr::new(0, 0, 0, 0, 0, 0).unwrap();

    bbt::mark(&dev, &[blk], BlockState::Bad, dev.flags()).unwrap();
    let table = BadBlockTable::get(&dev, blk).unwrap();
    let index = table.index_of(blk).unwrap();
    assert_eq!(table.blks()[index], BlockState::Bad as u8);

    let mut vblk = VirtualBlock::new(&dev);
    vblk.get().unwrap();
    assert_eq!(vblk.addr().blk(), 1);

    let mut other = VirtualBlock::new(&dev);
    assert!(other.get().is_err());
    vblk.put().unwrap();
    other.get().unwrap();
    other.put().unwrap();
}

#[test]
fn lba_walk_matches_virtual_block_layout() {
    let dev = open(&EmuConfig::default());
    let geo = dev.geo();
    let mut rng = SmallRng::seed_from_u64(SEED);

    for _ in 0..64 {
        let lba = rng.gen_range(0..geo.tbytes() / geo.sector_nbytes()) * geo.sector_nbytes();
        let addr = dev.addr_lba2gen(lba).unwrap();
        let blk_base = dev
            .addr_gen2lba(Addr::new(addr.ch(), addr.lun(), 0, addr.blk(), 0, 0).unwrap())
            .unwrap();

        // inside a block the byte offset follows page, plane, sector
        let within = (addr.pg() * geo.nplanes() + addr.pl()) * geo.nsectors() + addr.sec();
        assert_eq!(lba - blk_base, within * geo.sector_nbytes());
    }
}

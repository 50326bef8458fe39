#[macro_use]
extern crate log;
extern crate simplelog;

use ocssd::bbt::{self, BadBlockTable, BlockState};
use ocssd::buf;
use ocssd::config::*;
use ocssd::{Addr, Device, EmuDriver, SpanningBlock, VirtualBlock};
use rand::prelude::*;
use simplelog::*;
use time::macros::format_description;

fn main() -> ocssd::Result<()> {
    let log_cfg = ConfigBuilder::new()
        .set_time_format_custom(format_description!("[hour]:[minute]:[second].[subsecond]"))
        .build();

    if let Err(err) = SimpleLogger::init(LevelFilter::Debug, log_cfg) {
        eprintln!("logger: {}", err);
    }

    let config = EmuConfig::default().quirk(true);
    let dev = Device::open("emu0", EmuDriver::new(&config)?)?;
    let mut rng: SmallRng = SmallRng::seed_from_u64(SEED);

    // virtual block: whole block sequentially, then read back
    let mut vblk = VirtualBlock::new(&dev);
    vblk.get()?;
    vblk.erase()?;

    let mut data = dev.buf_alloc(dev.geo().vblk_nbytes())?;
    rng.fill_bytes(&mut data);
    vblk.write(&data)?;

    let mut back = dev.buf_alloc(data.len())?;
    vblk.read(&mut back)?;
    info!(
        "vblk {}: {} bytes, {} mismatches outside the scrambled range",
        vblk.addr(),
        vblk.pos_read(),
        buf::diff_masked(&data, &back, config.dont_care())
    );
    vblk.put()?;

    // spanning block over every channel and LUN, partial stripe then pad
    let blk = rng.gen_range(0..BLOCKS);
    let nch = dev.geo().nchannels();
    let nlun = dev.geo().nluns();
    let mut sblk = SpanningBlock::new(&dev, 0, nch - 1, 0, nlun - 1, blk)?;
    sblk.erase()?;

    let npages = rng.gen_range(1..ALL_LUNS);
    let mut data = dev.buf_alloc(npages * dev.geo().vpg_nbytes())?;
    buf::fill(&mut data);
    sblk.write(&data)?;
    let padded = sblk.pad()?;
    info!(
        "sblk {} .. {}: wrote {} bytes, padded {} to the {} byte stripe",
        sblk.bgn(),
        sblk.end(),
        data.len(),
        padded,
        sblk.stripe_nbytes()
    );

    // bad blocks: grow one, then restore the table
    let victim = Addr::new(0, 0, rng.gen_range(0..PLANES), blk, 0, 0)?;
    bbt::mark(&dev, &[victim], BlockState::GrownBad, dev.flags())?;

    let mut table = BadBlockTable::get(&dev, victim)?;
    info!("{}", table);
    table.blks_mut().fill(BlockState::Good as u8);
    info!("restored {} entries", table.set()?);

    Ok(())
}

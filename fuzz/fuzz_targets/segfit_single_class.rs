#![no_main]
use libfuzzer_sys::fuzz_target;
use segfit_hater::Args;

fuzz_target!(|args: Args| {
    segfit_hater::evaluate::<1>(args).unwrap();
});

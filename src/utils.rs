mod rand_compat;

pub(crate) use rand_compat::RngCompat;
